use crate::errors::ReplayError;
use crate::event::{Event, TriggerPredicate};
use crate::synthesis::delta_debug::Delta;
use serde::{Deserialize, Serialize};

/// A synchronization relaxation for one script event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitDelta {
    /// Dispatch `target` as soon as `trigger` is observed live instead of
    /// after its recorded pause.
    AddTrigger { target: String, trigger: String },
    /// Leave `target` as recorded.
    NoSyncNeeded { target: String },
}

impl WaitDelta {
    pub fn target(&self) -> &str {
        match self {
            Self::AddTrigger { target, .. } | Self::NoSyncNeeded { target } => target,
        }
    }
}

impl Delta<Vec<Event>> for WaitDelta {
    fn id(&self) -> String {
        match self {
            Self::AddTrigger { target, trigger } => format!("add_trigger_{target}_{trigger}"),
            Self::NoSyncNeeded { target } => format!("no_sync_{target}"),
        }
    }

    fn is_identity(&self) -> bool {
        matches!(self, Self::NoSyncNeeded { .. })
    }

    fn apply(&self, events: &Vec<Event>) -> Result<Vec<Event>, ReplayError> {
        match self {
            Self::NoSyncNeeded { .. } => Ok(events.clone()),
            Self::AddTrigger { target, trigger } => add_trigger(events, target, trigger),
        }
    }
}

/// Index of the last replayable event before `index`.
fn previous_replayable(events: &[Event], index: usize) -> Option<usize> {
    events[..index]
        .iter()
        .rposition(|e| e.kind.is_replayable())
}

fn add_trigger(events: &[Event], target: &str, trigger: &str) -> Result<Vec<Event>, ReplayError> {
    let index = events
        .iter()
        .position(|e| e.meta.id == target)
        .ok_or_else(|| ReplayError::EventNotFound(target.to_string()))?;
    if !events.iter().any(|e| e.meta.id == trigger) {
        return Err(ReplayError::EventNotFound(trigger.to_string()));
    }

    let previous = previous_replayable(events, index);
    let mut out = events.to_vec();
    let first_cleared = previous.map_or(0, |p| p + 1);
    for event in &mut out[first_cleared..=index] {
        event.timing.wait_time = 0;
    }
    let start = previous.map(|p| events[p].meta.id.clone());
    let timing = &mut out[index].timing;
    timing.wait_event = Some(trigger.to_string());
    timing.trigger_condition = Some(vec![TriggerPredicate {
        event_id: trigger.to_string(),
        start,
    }]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn script() -> Vec<Event> {
        [
            (EventKind::Dom, 0),
            (EventKind::Completed, 400),
            (EventKind::Completed, 300),
            (EventKind::Dom, 200),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, (kind, wait))| {
            let mut e = Event::new(kind, 0);
            e.meta.id = format!("event{i}");
            e.timing.wait_time = wait;
            e
        })
        .collect()
    }

    #[test]
    fn add_trigger_clears_waits_since_previous_dispatch() {
        let delta = WaitDelta::AddTrigger {
            target: "event3".to_string(),
            trigger: "event1".to_string(),
        };
        let base = script();
        let out = delta.apply(&base).expect("apply");
        let waits = out.iter().map(|e| e.timing.wait_time).collect::<Vec<_>>();
        assert_eq!(waits, vec![0, 0, 0, 0]);
        assert_eq!(out[3].timing.wait_event.as_deref(), Some("event1"));
        let condition = out[3].timing.trigger_condition.clone().expect("condition");
        assert_eq!(condition[0].start.as_deref(), Some("event0"));
        assert_eq!(base[1].timing.wait_time, 400);
        assert_eq!(delta.id(), "add_trigger_event3_event1");
    }

    #[test]
    fn sentinel_is_the_identity() {
        let delta = WaitDelta::NoSyncNeeded {
            target: "event3".to_string(),
        };
        assert!(delta.is_identity());
        assert_eq!(delta.apply(&script()).expect("apply"), script());
    }

    #[test]
    fn unknown_target_is_reported() {
        let delta = WaitDelta::AddTrigger {
            target: "event9".to_string(),
            trigger: "event1".to_string(),
        };
        assert!(matches!(
            delta.apply(&script()),
            Err(ReplayError::EventNotFound(id)) if id == "event9"
        ));
    }
}
