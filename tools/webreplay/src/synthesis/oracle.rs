use crate::event::{Event, EventKind};
use crate::replay::ReplayRun;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    MissingCapture { event_id: String, position: usize },
    Mismatch {
        event_id: String,
        position: usize,
        expected: Option<String>,
        actual: Option<String>,
    },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// A run passes when it produced, position by position, the same captured
/// text as every capture event of the script. How the run ended does not
/// matter once the captures are in.
pub fn check_replay(script: &[Event], run: &ReplayRun) -> Verdict {
    let expected = script.iter().filter(|e| e.kind == EventKind::Capture);
    for (position, event) in expected.enumerate() {
        let Some(capture) = run.captures.get(position) else {
            return Verdict::MissingCapture {
                event_id: event.meta.id.clone(),
                position,
            };
        };
        let want = event.recorded_inner_text();
        if capture.inner_text != want {
            return Verdict::Mismatch {
                event_id: event.meta.id.clone(),
                position,
                expected: want,
                actual: capture.inner_text.clone(),
            };
        }
    }
    Verdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Capture;
    use serde_json::json;

    fn capture_event(id: &str, text: &str) -> Event {
        let mut e = Event::new(EventKind::Capture, 0);
        e.meta.id = id.to_string();
        e.data.target = Some(json!({"snapshot": {"prop": {"innerText": text}}}));
        e
    }

    fn scraped(text: &str) -> Capture {
        Capture {
            inner_text: Some(text.to_string()),
            ..Capture::default()
        }
    }

    #[test]
    fn matching_captures_pass() {
        let script = vec![capture_event("event1", "Total: 3"), capture_event("event2", "Done")];
        let run = ReplayRun {
            captures: vec![scraped("Total: 3"), scraped("Done")],
            ..ReplayRun::default()
        };
        assert_eq!(check_replay(&script, &run), Verdict::Pass);
    }

    #[test]
    fn first_mismatch_fails_even_if_later_captures_match() {
        let script = vec![capture_event("event1", "Total: 3"), capture_event("event2", "Done")];
        let run = ReplayRun {
            captures: vec![scraped("Total: 0"), scraped("Done")],
            ..ReplayRun::default()
        };
        assert!(matches!(
            check_replay(&script, &run),
            Verdict::Mismatch { position: 0, .. }
        ));
    }

    #[test]
    fn missing_capture_fails() {
        let script = vec![capture_event("event1", "Total: 3")];
        let run = ReplayRun::default();
        assert!(matches!(
            check_replay(&script, &run),
            Verdict::MissingCapture { position: 0, .. }
        ));
    }

    #[test]
    fn run_error_alone_does_not_fail_the_captures() {
        let script = vec![capture_event("event1", "Total: 3")];
        let timed_out = ReplayRun {
            captures: vec![scraped("Total: 3")],
            error: Some("trial timed out".to_string()),
            ..ReplayRun::default()
        };
        assert_eq!(check_replay(&script, &timed_out), Verdict::Pass);

        let errored = ReplayRun {
            error: Some("boom".to_string()),
            ..ReplayRun::default()
        };
        assert!(check_replay(&[], &errored).passed());
    }
}
