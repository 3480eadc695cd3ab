//! Wait synthesis: learn which recorded pauses can be replaced by waiting
//! for a specific network request to complete.

pub mod delta_debug;
pub mod deltas;
pub mod oracle;
pub mod session;
pub mod triggers;

pub use delta_debug::{grouped_delta_debug, Delta, SearchOutcome, TrialRecord};
pub use deltas::WaitDelta;
pub use oracle::{check_replay, Verdict};
pub use session::{RunSummary, SynthesisReport, SynthesisSession};
pub use triggers::{discover_triggers, stable_completed_urls, TriggerCandidate, TriggerMap};
