//! Replay of recorded scripts against a live browser session.
//!
//! [`engine::ReplayEngine`] walks a script one event at a time, mapping each
//! recorded frame onto a live port, pacing dispatches with the configured
//! timing strategy and waiting for the page to acknowledge every dispatch.
//! The live re-execution is recorded as it happens and handed back as a
//! [`run::ReplayRun`] once the replay finishes.

pub mod engine;
pub mod run;
pub mod trigger;

pub use engine::{Continuation, ReplayConfig, ReplayEngine};
pub use run::ReplayRun;
