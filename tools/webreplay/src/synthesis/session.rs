//! End-to-end wait synthesis for one stored script.
//!
//! The script is replayed until enough passing baselines exist, trigger
//! candidates are derived from them, and the grouped search runs live
//! trials to decide which recorded waits can become trigger waits. Every
//! run is saved as a tagged script variant and summarized in the
//! `learningReplays` inspection log.

use crate::config::{AppConfig, ReplayParams};
use crate::errors::ReplayError;
use crate::event::Event;
use crate::logging::append_run_log;
use crate::ports::PortTable;
use crate::replay::{ReplayConfig, ReplayEngine, ReplayRun};
use crate::runtime::ReplayRuntime;
use crate::script_store::SaveScriptRequest;
use crate::synthesis::delta_debug::{grouped_delta_debug, Delta, TrialRecord};
use crate::synthesis::deltas::WaitDelta;
use crate::synthesis::oracle::{check_replay, Verdict};
use crate::synthesis::triggers::{discover_triggers, stable_completed_urls, TriggerMap};
use crate::timing::TriggeredEventsNoWait;
use crate::types::TabId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::{Duration, UNIX_EPOCH};

pub const LEARNING_REPLAYS_KEY: &str = "learningReplays";
pub const LEARNING_TRIGGERS_KEY: &str = "learningTriggers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisReport {
    pub script: String,
    /// Id of the copy of the input script the suite hangs off.
    pub suite_id: i64,
    pub baseline_runs: usize,
    pub trigger_map: TriggerMap,
    pub trials: Vec<TrialRecord>,
    pub accepted: Vec<WaitDelta>,
    pub final_script_id: i64,
    pub events: Vec<Event>,
}

/// Inspection log line for one live run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub label: String,
    pub passed: bool,
    pub verdict: Verdict,
    pub index: usize,
    pub captures: usize,
    pub elapsed_ms: u64,
    pub element_timeouts: u32,
    pub trigger_timeouts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SynthesisSession {
    rt: ReplayRuntime,
    config: AppConfig,
    ports: PortTable,
    engine: ReplayEngine,
    original: Vec<Event>,
    suite_name: String,
    suite_id: Option<i64>,
    summaries: Vec<RunSummary>,
}

impl SynthesisSession {
    pub fn new(rt: ReplayRuntime, config: AppConfig) -> Self {
        let engine = ReplayEngine::new(trial_params(&config));
        Self::with_engine(rt, config, engine)
    }

    /// Use a prepared engine (e.g. with a seeded random source). Its
    /// parameters are replaced by the trial parameters.
    pub fn with_engine(rt: ReplayRuntime, config: AppConfig, mut engine: ReplayEngine) -> Self {
        engine.set_params(trial_params(&config));
        engine.add_timing_override(Box::new(TriggeredEventsNoWait));
        Self {
            rt,
            config,
            ports: PortTable::new(),
            engine,
            original: Vec::new(),
            suite_name: String::new(),
            suite_id: None,
            summaries: Vec::new(),
        }
    }

    pub fn summaries(&self) -> &[RunSummary] {
        &self.summaries
    }

    pub fn run(&mut self, script_name: &str) -> Result<SynthesisReport, ReplayError> {
        let script = self.rt.scripts.get_script(script_name)?;
        self.original = script.events;
        self.suite_name = format!("{script_name} synth {}", self.suite_stamp());
        let suite_id = self.rt.scripts.save_script(SaveScriptRequest {
            name: self.suite_name.clone(),
            events: self.original.clone(),
            source_id: script.id,
            tag: "original".to_string(),
            ..SaveScriptRequest::default()
        })?;
        self.suite_id = Some(suite_id);
        append_run_log(
            "info",
            "synthesis.started",
            json!({"script": script_name, "suite": self.suite_name, "events": self.original.len()}),
        );

        let baselines = self.collect_baselines()?;
        let stable = stable_completed_urls(&baselines);
        let trigger_map = discover_triggers(&self.original, &stable);
        self.rt.kv.set(
            LEARNING_TRIGGERS_KEY,
            serde_json::to_value(&trigger_map).map_err(|e| ReplayError::Synthesis(e.to_string()))?,
        )?;
        append_run_log(
            "info",
            "synthesis.triggers",
            json!({"stable_urls": stable.len(), "groups": trigger_map.entries.len()}),
        );

        let groups = trigger_map.delta_groups();
        let base = self.original.clone();
        let outcome = grouped_delta_debug(&base, &groups, |candidate, delta| {
            self.trial(candidate, delta)
        })?;

        let final_script_id = self.rt.scripts.save_script(SaveScriptRequest {
            name: self.suite_name.clone(),
            events: outcome.result.clone(),
            source_id: Some(suite_id),
            tag: "final".to_string(),
            notes: accepted_notes(&outcome.accepted),
            ..SaveScriptRequest::default()
        })?;
        append_run_log(
            "info",
            "synthesis.finished",
            json!({
                "suite": self.suite_name,
                "final_script_id": final_script_id,
                "trials": outcome.trials.iter().filter(|t| t.ran).count(),
            }),
        );

        Ok(SynthesisReport {
            script: script_name.to_string(),
            suite_id,
            baseline_runs: baselines.len(),
            trigger_map,
            trials: outcome.trials,
            accepted: outcome.accepted.into_iter().map(|(_, d)| d).collect(),
            final_script_id,
            events: outcome.result,
        })
    }

    fn suite_stamp(&self) -> u128 {
        self.rt
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis())
    }

    fn collect_baselines(&mut self) -> Result<Vec<ReplayRun>, ReplayError> {
        let wanted = self.config.synthesis.baseline_runs as usize;
        let mut passing = Vec::new();
        let events = self.original.clone();
        for attempt in 0..self.config.synthesis.max_baseline_attempts {
            let (run, verdict) = self.live_run(&events, "find_trigger")?;
            append_run_log(
                "info",
                "synthesis.baseline",
                json!({"attempt": attempt, "passed": verdict.passed()}),
            );
            if verdict.passed() {
                passing.push(run);
                if passing.len() >= wanted {
                    return Ok(passing);
                }
            }
        }
        Err(ReplayError::Synthesis(format!(
            "only {} of {wanted} baseline replays passed",
            passing.len()
        )))
    }

    /// A trial passes only if every one of its runs passes. All runs are
    /// made either way so each one lands in the store and the inspection log.
    fn trial(&mut self, candidate: &[Event], delta: &WaitDelta) -> Result<bool, ReplayError> {
        let label = delta.id();
        self.rt.scripts.save_script(SaveScriptRequest {
            name: self.suite_name.clone(),
            events: candidate.to_vec(),
            source_id: self.suite_id,
            tag: format!("original,{label}"),
            ..SaveScriptRequest::default()
        })?;
        let mut passed = true;
        for _ in 0..self.config.synthesis.runs_per_trial {
            let (_, verdict) = self.live_run(candidate, &label)?;
            passed &= verdict.passed();
        }
        Ok(passed)
    }

    /// Replay `events` once, judge it, save it and close what it opened.
    fn live_run(&mut self, events: &[Event], label: &str) -> Result<(ReplayRun, Verdict), ReplayError> {
        let config = ReplayConfig {
            script_id: self.suite_id,
            ..ReplayConfig::default()
        };
        self.engine.replay(&self.rt, events.to_vec(), config, None);
        let deadline =
            self.rt.clock.now() + Duration::from_secs(self.config.synthesis.trial_timeout_secs);
        let run = match self.engine.drive(&self.rt, &mut self.ports, Some(deadline))? {
            Some(run) => run,
            None => {
                self.engine
                    .finish(&self.rt, Some("trial timed out".to_string()));
                self.engine.drive(&self.rt, &mut self.ports, None)?.ok_or_else(|| {
                    ReplayError::InvalidState("timed out trial did not complete".to_string())
                })?
            }
        };

        let verdict = check_replay(&self.original, &run);
        let passed = verdict.passed();
        self.rt.scripts.save_script(SaveScriptRequest {
            name: self.suite_name.clone(),
            events: run.events.clone(),
            source_id: self.suite_id,
            tag: format!("replay,{label},{passed}"),
            captures: run.captures.clone(),
            notes: run.error.clone().unwrap_or_default(),
            params: serde_json::to_value(self.engine.params()).ok(),
        })?;
        self.close_touched_tabs(&run);

        self.summaries.push(RunSummary {
            label: label.to_string(),
            passed,
            verdict: verdict.clone(),
            index: run.index,
            captures: run.captures.len(),
            elapsed_ms: run.elapsed_ms,
            element_timeouts: run.element_timeouts,
            trigger_timeouts: run.trigger_timeouts,
            error: run.error.clone(),
        });
        self.rt.kv.set(
            LEARNING_REPLAYS_KEY,
            serde_json::to_value(&self.summaries).unwrap_or(Value::Null),
        )?;
        Ok((run, verdict))
    }

    /// Later runs must not see this run's tabs or their network traffic.
    fn close_touched_tabs(&mut self, run: &ReplayRun) {
        let mut tabs = run
            .events
            .iter()
            .filter_map(|e| {
                e.frame
                    .tab
                    .or_else(|| e.data.extra.get("tabId").and_then(Value::as_i64))
            })
            .collect::<BTreeSet<TabId>>();
        tabs.extend(self.engine.correspondence().tab_mapping.values().copied());
        for tab in tabs {
            if let Err(err) = self.rt.host.remove_tab(tab) {
                append_run_log(
                    "warn",
                    "synthesis.close_tab_failed",
                    json!({"tab": tab, "error": err.to_string()}),
                );
            }
            self.ports.remove_tab(tab);
        }
    }
}

/// Trials replay slowly and save nothing on their own; the session saves
/// every run with its label.
fn trial_params(config: &AppConfig) -> ReplayParams {
    let mut params = config.trial_params();
    params.save_replay = false;
    params
}

fn accepted_notes(accepted: &[(usize, WaitDelta)]) -> String {
    accepted
        .iter()
        .filter(|(_, delta)| !delta.is_identity())
        .map(|(_, delta)| delta.id())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_list_only_real_relaxations() {
        let accepted = vec![
            (
                0,
                WaitDelta::NoSyncNeeded {
                    target: "event0".to_string(),
                },
            ),
            (
                1,
                WaitDelta::AddTrigger {
                    target: "event3".to_string(),
                    trigger: "event2".to_string(),
                },
            ),
        ];
        assert_eq!(accepted_notes(&accepted), "add_trigger_event3_event2");
    }

    #[test]
    fn trial_params_disable_engine_side_saving() {
        let params = trial_params(&AppConfig::default());
        assert!(!params.save_replay);
        assert_eq!(params.timing_strategy, "slower");
        assert_eq!(params.event_timeout_secs, 40);
    }
}
