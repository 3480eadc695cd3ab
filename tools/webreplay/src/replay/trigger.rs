use crate::event::{Event, EventKind, TriggerPredicate};

/// True when the live event plays the role of the recorded `trigger`: it was
/// re-produced from it, or both are completed requests for the same URL.
fn plays_role_of(live: &Event, predicate: &TriggerPredicate, trigger: Option<&Event>) -> bool {
    if live.meta.record_id.as_deref() == Some(predicate.event_id.as_str()) {
        return true;
    }
    match trigger {
        Some(trigger) if trigger.kind == EventKind::Completed => {
            live.kind == EventKind::Completed
                && live.data.url.is_some()
                && live.data.url == trigger.data.url
        }
        _ => false,
    }
}

/// Scan the live events newest-first for a match, stopping once the start
/// boundary has been examined. The boundary event itself may match.
pub fn predicate_met(live: &[Event], script: &[Event], predicate: &TriggerPredicate) -> bool {
    let trigger = script.iter().find(|e| e.meta.id == predicate.event_id);
    for event in live.iter().rev() {
        if plays_role_of(event, predicate, trigger) {
            return true;
        }
        if predicate.start.is_some() && event.meta.record_id == predicate.start {
            return false;
        }
    }
    false
}

/// Every predicate of the conjunction must hold.
pub fn conditions_met(live: &[Event], script: &[Event], conditions: &[TriggerPredicate]) -> bool {
    conditions
        .iter()
        .all(|predicate| predicate_met(live, script, predicate))
}
