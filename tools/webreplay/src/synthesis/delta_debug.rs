//! Grouped delta debugging.
//!
//! Candidates come in groups; at most one delta per group ends up in the
//! result. Groups are visited in order. Within a group candidates are tried
//! in order on top of everything accepted so far, and the first one whose
//! trial passes is accepted. Identity candidates change nothing and are
//! accepted without spending a trial.

use crate::errors::ReplayError;
use crate::logging::append_run_log;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// A pure transformation of a script under search.
pub trait Delta<S> {
    fn id(&self) -> String;
    fn apply(&self, base: &S) -> Result<S, ReplayError>;
    fn is_identity(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub group: usize,
    pub delta: String,
    pub passed: bool,
    /// False for identity candidates accepted without a live trial.
    pub ran: bool,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome<S, D> {
    /// Accepted delta per group, in group order.
    pub accepted: Vec<(usize, D)>,
    pub result: S,
    pub trials: Vec<TrialRecord>,
}

/// Apply accepted deltas in group order.
pub fn apply_accepted<S: Clone, D: Delta<S>>(
    base: &S,
    accepted: &BTreeMap<usize, D>,
) -> Result<S, ReplayError> {
    let mut current = base.clone();
    for delta in accepted.values() {
        current = delta.apply(&current)?;
    }
    Ok(current)
}

/// One greedy pass over `groups`. `trial` runs a candidate script live and
/// reports whether it passed.
pub fn grouped_delta_debug<S, D, T>(
    base: &S,
    groups: &[Vec<D>],
    mut trial: T,
) -> Result<SearchOutcome<S, D>, ReplayError>
where
    S: Clone,
    D: Delta<S> + Clone,
    T: FnMut(&S, &D) -> Result<bool, ReplayError>,
{
    let mut accepted = BTreeMap::new();
    let mut trials = Vec::new();

    for (group, candidates) in groups.iter().enumerate() {
        for delta in candidates {
            if delta.is_identity() {
                trials.push(TrialRecord {
                    group,
                    delta: delta.id(),
                    passed: true,
                    ran: false,
                });
                accepted.insert(group, delta.clone());
                break;
            }

            let candidate = delta.apply(&apply_accepted(base, &accepted)?)?;
            let passed = trial(&candidate, delta)?;
            append_run_log(
                "info",
                "synthesis.trial.completed",
                json!({"group": group, "delta": delta.id(), "passed": passed}),
            );
            trials.push(TrialRecord {
                group,
                delta: delta.id(),
                passed,
                ran: true,
            });
            if passed {
                accepted.insert(group, delta.clone());
                break;
            }
        }
    }

    let result = apply_accepted(base, &accepted)?;
    Ok(SearchOutcome {
        accepted: accepted.into_iter().collect(),
        result,
        trials,
    })
}
