use crate::event::{Capture, Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outcome of one replay attempt. Built once when the replay finishes and
/// never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplayRun {
    pub script_id: Option<i64>,
    /// Live re-recording of the replay.
    pub events: Vec<Event>,
    pub captures: Vec<Capture>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    /// Script index reached when the replay stopped.
    pub index: usize,
    pub element_timeouts: u32,
    pub trigger_timeouts: u32,
}

impl ReplayRun {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// URLs of every network request that completed during the run.
    pub fn completed_urls(&self) -> BTreeSet<String> {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Completed)
            .filter_map(|e| e.data.url.clone())
            .collect()
    }
}
