//! Trigger-candidate discovery from passing baseline runs.

use crate::event::{Event, EventKind};
use crate::replay::ReplayRun;
use crate::synthesis::deltas::WaitDelta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCandidate {
    /// A completed request recorded between the event and the previous
    /// dispatched event.
    Event { event_id: String },
    NoSyncNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub event_id: String,
    pub candidates: Vec<TriggerCandidate>,
}

/// Candidates per dispatched event, in script order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerMap {
    pub entries: Vec<TriggerEntry>,
}

impl TriggerMap {
    pub fn get(&self, event_id: &str) -> Option<&[TriggerCandidate]> {
        self.entries
            .iter()
            .find(|entry| entry.event_id == event_id)
            .map(|entry| entry.candidates.as_slice())
    }

    /// One delta group per entry. The sentinel goes last so real triggers
    /// are tried first.
    pub fn delta_groups(&self) -> Vec<Vec<WaitDelta>> {
        self.entries
            .iter()
            .map(|entry| {
                entry
                    .candidates
                    .iter()
                    .map(|candidate| match candidate {
                        TriggerCandidate::Event { event_id } => WaitDelta::AddTrigger {
                            target: entry.event_id.clone(),
                            trigger: event_id.clone(),
                        },
                        TriggerCandidate::NoSyncNeeded => WaitDelta::NoSyncNeeded {
                            target: entry.event_id.clone(),
                        },
                    })
                    .collect()
            })
            .collect()
    }
}

/// Completed-request URLs seen in every run.
pub fn stable_completed_urls(runs: &[ReplayRun]) -> BTreeSet<String> {
    let mut sets = runs.iter().map(ReplayRun::completed_urls);
    let Some(first) = sets.next() else {
        return BTreeSet::new();
    };
    sets.fold(first, |acc, urls| acc.intersection(&urls).cloned().collect())
}

pub fn discover_triggers(events: &[Event], stable_urls: &BTreeSet<String>) -> TriggerMap {
    let mut entries = Vec::new();
    let mut pending = Vec::new();
    for event in events {
        match event.kind {
            EventKind::Completed => {
                if event.data.url.as_ref().is_some_and(|url| stable_urls.contains(url)) {
                    pending.push(TriggerCandidate::Event {
                        event_id: event.meta.id.clone(),
                    });
                }
            }
            EventKind::Dom | EventKind::Capture => {
                let mut candidates = std::mem::take(&mut pending);
                candidates.push(TriggerCandidate::NoSyncNeeded);
                entries.push(TriggerEntry {
                    event_id: event.meta.id.clone(),
                    candidates,
                });
            }
            EventKind::Error => {}
        }
    }
    TriggerMap { entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, kind: EventKind, url: Option<&str>) -> Event {
        let mut e = Event::new(kind, 0);
        e.meta.id = id.to_string();
        e.data.url = url.map(str::to_string);
        e
    }

    fn run_with(urls: &[&str]) -> ReplayRun {
        ReplayRun {
            events: urls
                .iter()
                .map(|u| event("live", EventKind::Completed, Some(u)))
                .collect(),
            ..ReplayRun::default()
        }
    }

    #[test]
    fn only_urls_seen_in_every_run_survive() {
        let runs = [
            run_with(&["http://a.test/api", "http://ads.test/x1"]),
            run_with(&["http://a.test/api", "http://ads.test/x2"]),
        ];
        let urls = stable_completed_urls(&runs);
        assert_eq!(urls.into_iter().collect::<Vec<_>>(), vec!["http://a.test/api"]);
        assert!(stable_completed_urls(&[]).is_empty());
    }

    #[test]
    fn candidates_are_requests_between_dispatches() {
        let events = vec![
            event("event0", EventKind::Dom, None),
            event("event1", EventKind::Completed, Some("http://a.test/api")),
            event("event2", EventKind::Completed, Some("http://ads.test/x")),
            event("event3", EventKind::Dom, None),
            event("event4", EventKind::Capture, None),
        ];
        let stable = BTreeSet::from(["http://a.test/api".to_string()]);
        let map = discover_triggers(&events, &stable);

        assert_eq!(map.get("event0"), Some(&[TriggerCandidate::NoSyncNeeded][..]));
        assert_eq!(
            map.get("event3"),
            Some(
                &[
                    TriggerCandidate::Event {
                        event_id: "event1".to_string()
                    },
                    TriggerCandidate::NoSyncNeeded
                ][..]
            )
        );
        assert_eq!(map.get("event4"), Some(&[TriggerCandidate::NoSyncNeeded][..]));

        let groups = map.delta_groups();
        assert_eq!(groups.len(), 3);
        assert!(matches!(
            &groups[1][0],
            WaitDelta::AddTrigger { target, trigger } if target == "event3" && trigger == "event1"
        ));
    }
}
