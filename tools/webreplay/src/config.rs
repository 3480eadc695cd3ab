use crate::errors::ReplayError;
use crate::runtime::FileSystem;
use crate::types::{BrokenChannelStrategy, PartialAckStrategy, TimingStrategy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub timing_strategy: Option<String>,
    pub unattended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub replay: ReplayParams,
    pub synthesis: SynthesisConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Knobs consulted by the replay engine. A snapshot of this struct is what
/// the `params` message sends to every page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayParams {
    pub save_replay: bool,
    pub cascade_check: bool,
    pub atomic: bool,
    pub event_timeout_secs: u64,
    pub trigger_timeout_secs: u64,
    pub timing_strategy: String,
    pub broken_channel_strategy: String,
    pub partial_ack_strategy: String,
    pub default_wait_ms: u64,
    pub default_wait_new_tab_ms: u64,
    pub open_new_tab: bool,
    pub unattended: bool,
    pub finish_grace_ms: u64,
    pub first_dispatch_delay_ms: u64,
    pub max_wait_ms: u64,
    pub dispatch_padding_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SynthesisConfig {
    pub baseline_runs: u32,
    pub max_baseline_attempts: u32,
    pub runs_per_trial: u32,
    pub trial_timeout_secs: u64,
    pub trial_event_timeout_secs: u64,
    pub trial_timing_strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub screenshot_dir: PathBuf,
    pub screenshot_budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for ReplayParams {
    fn default() -> Self {
        Self {
            save_replay: true,
            cascade_check: true,
            atomic: false,
            event_timeout_secs: 0,
            trigger_timeout_secs: 0,
            timing_strategy: "mimic".to_string(),
            broken_channel_strategy: "retry".to_string(),
            partial_ack_strategy: "abort".to_string(),
            default_wait_ms: 100,
            default_wait_new_tab_ms: 4000,
            open_new_tab: true,
            unattended: false,
            finish_grace_ms: 1000,
            first_dispatch_delay_ms: 1000,
            max_wait_ms: 10_000,
            dispatch_padding_ms: 10,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            replay: ReplayParams::default(),
            synthesis: SynthesisConfig {
                baseline_runs: 2,
                max_baseline_attempts: 6,
                runs_per_trial: 2,
                trial_timeout_secs: 300,
                trial_event_timeout_secs: 40,
                trial_timing_strategy: "slower".to_string(),
            },
            storage: StorageConfig {
                database_path: PathBuf::from(".webreplay/scripts.sqlite"),
                screenshot_dir: PathBuf::from(".webreplay/snapshots"),
                screenshot_budget_bytes: 100 * 1024 * 1024,
            },
            logging: LoggingConfig {
                path: PathBuf::from(".webreplay/logs/run.jsonl"),
                max_payload_bytes: 4096,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl AppConfig {
    /// Replay parameters used for synthesis trials: slower pacing and a
    /// per-event timeout so a stuck trial cannot hang the search.
    pub fn trial_params(&self) -> ReplayParams {
        let mut params = self.replay.clone();
        params.event_timeout_secs = self.synthesis.trial_event_timeout_secs;
        params.timing_strategy = self.synthesis.trial_timing_strategy.clone();
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    replay: Option<PartialReplayParams>,
    synthesis: Option<PartialSynthesisConfig>,
    storage: Option<PartialStorageConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReplayParams {
    save_replay: Option<bool>,
    cascade_check: Option<bool>,
    atomic: Option<bool>,
    event_timeout_secs: Option<u64>,
    trigger_timeout_secs: Option<u64>,
    timing_strategy: Option<String>,
    broken_channel_strategy: Option<String>,
    partial_ack_strategy: Option<String>,
    default_wait_ms: Option<u64>,
    default_wait_new_tab_ms: Option<u64>,
    open_new_tab: Option<bool>,
    unattended: Option<bool>,
    finish_grace_ms: Option<u64>,
    first_dispatch_delay_ms: Option<u64>,
    max_wait_ms: Option<u64>,
    dispatch_padding_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSynthesisConfig {
    baseline_runs: Option<u32>,
    max_baseline_attempts: Option<u32>,
    runs_per_trial: Option<u32>,
    trial_timeout_secs: Option<u64>,
    trial_event_timeout_secs: Option<u64>,
    trial_timing_strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStorageConfig {
    database_path: Option<PathBuf>,
    screenshot_dir: Option<PathBuf>,
    screenshot_budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

pub fn load_config(overrides: &CliOverrides, fs: &dyn FileSystem) -> Result<AppConfig, ReplayError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        cfg = parse_config(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Parse a TOML document on top of the defaults without validating it.
pub fn parse_config(contents: &str) -> Result<AppConfig, ReplayError> {
    let mut cfg = AppConfig::default();
    let partial: PartialAppConfig =
        toml::from_str(contents).map_err(|e| ReplayError::ConfigParse(e.to_string()))?;
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(replay) = partial.replay {
        let target = &mut cfg.replay;
        if let Some(value) = replay.save_replay {
            target.save_replay = value;
        }
        if let Some(value) = replay.cascade_check {
            target.cascade_check = value;
        }
        if let Some(value) = replay.atomic {
            target.atomic = value;
        }
        if let Some(value) = replay.event_timeout_secs {
            target.event_timeout_secs = value;
        }
        if let Some(value) = replay.trigger_timeout_secs {
            target.trigger_timeout_secs = value;
        }
        if let Some(value) = replay.timing_strategy {
            target.timing_strategy = value;
        }
        if let Some(value) = replay.broken_channel_strategy {
            target.broken_channel_strategy = value;
        }
        if let Some(value) = replay.partial_ack_strategy {
            target.partial_ack_strategy = value;
        }
        if let Some(value) = replay.default_wait_ms {
            target.default_wait_ms = value;
        }
        if let Some(value) = replay.default_wait_new_tab_ms {
            target.default_wait_new_tab_ms = value;
        }
        if let Some(value) = replay.open_new_tab {
            target.open_new_tab = value;
        }
        if let Some(value) = replay.unattended {
            target.unattended = value;
        }
        if let Some(value) = replay.finish_grace_ms {
            target.finish_grace_ms = value;
        }
        if let Some(value) = replay.first_dispatch_delay_ms {
            target.first_dispatch_delay_ms = value;
        }
        if let Some(value) = replay.max_wait_ms {
            target.max_wait_ms = value;
        }
        if let Some(value) = replay.dispatch_padding_ms {
            target.dispatch_padding_ms = value;
        }
    }

    if let Some(synthesis) = partial.synthesis {
        if let Some(value) = synthesis.baseline_runs {
            cfg.synthesis.baseline_runs = value;
        }
        if let Some(value) = synthesis.max_baseline_attempts {
            cfg.synthesis.max_baseline_attempts = value;
        }
        if let Some(value) = synthesis.runs_per_trial {
            cfg.synthesis.runs_per_trial = value;
        }
        if let Some(value) = synthesis.trial_timeout_secs {
            cfg.synthesis.trial_timeout_secs = value;
        }
        if let Some(value) = synthesis.trial_event_timeout_secs {
            cfg.synthesis.trial_event_timeout_secs = value;
        }
        if let Some(value) = synthesis.trial_timing_strategy {
            cfg.synthesis.trial_timing_strategy = value;
        }
    }

    if let Some(storage) = partial.storage {
        if let Some(value) = storage.database_path {
            cfg.storage.database_path = value;
        }
        if let Some(value) = storage.screenshot_dir {
            cfg.storage.screenshot_dir = value;
        }
        if let Some(value) = storage.screenshot_budget_bytes {
            cfg.storage.screenshot_budget_bytes = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.database_path {
        cfg.storage.database_path = path.clone();
    }
    if let Some(strategy) = &overrides.timing_strategy {
        cfg.replay.timing_strategy = strategy.clone();
    }
    if overrides.unattended {
        cfg.replay.unattended = true;
    }
}

pub fn validate_config(cfg: &AppConfig) -> Result<(), ReplayError> {
    TimingStrategy::parse(&cfg.replay.timing_strategy)
        .map_err(|e| ReplayError::InvalidConfig(format!("replay.timing_strategy: {e}")))?;
    TimingStrategy::parse(&cfg.synthesis.trial_timing_strategy).map_err(|e| {
        ReplayError::InvalidConfig(format!("synthesis.trial_timing_strategy: {e}"))
    })?;
    BrokenChannelStrategy::parse(&cfg.replay.broken_channel_strategy)
        .map_err(|e| ReplayError::InvalidConfig(format!("replay.broken_channel_strategy: {e}")))?;
    PartialAckStrategy::parse(&cfg.replay.partial_ack_strategy)
        .map_err(|e| ReplayError::InvalidConfig(format!("replay.partial_ack_strategy: {e}")))?;

    if cfg.synthesis.baseline_runs == 0 {
        return Err(ReplayError::InvalidConfig(
            "synthesis.baseline_runs must be greater than zero".to_string(),
        ));
    }
    if cfg.synthesis.max_baseline_attempts < cfg.synthesis.baseline_runs {
        return Err(ReplayError::InvalidConfig(
            "synthesis.max_baseline_attempts must be at least synthesis.baseline_runs".to_string(),
        ));
    }
    if cfg.synthesis.runs_per_trial == 0 {
        return Err(ReplayError::InvalidConfig(
            "synthesis.runs_per_trial must be greater than zero".to_string(),
        ));
    }
    if cfg.replay.default_wait_ms == 0 {
        return Err(ReplayError::InvalidConfig(
            "replay.default_wait_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn screenshots_and_logs_have_separate_budgets() {
        let cfg = parse_config(
            "[storage]\nscreenshot_budget_bytes = 2048\n\n[logging]\nbudget_bytes = 4096\n",
        )
        .expect("parse");
        assert_eq!(cfg.storage.screenshot_budget_bytes, 2048);
        assert_eq!(cfg.logging.budget_bytes, 4096);

        let defaults = AppConfig::default();
        let cfg = parse_config("[logging]\nbudget_bytes = 4096\n").expect("parse");
        assert_eq!(
            cfg.storage.screenshot_budget_bytes,
            defaults.storage.screenshot_budget_bytes
        );
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let fs = FakeFileSystem::with_file(
            "/cfg/webreplay.toml",
            "[replay]\ntiming_strategy = \"speed\"\nevent_timeout_secs = 5\n\n[synthesis]\nruns_per_trial = 3\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/cfg/webreplay.toml")),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, &fs).expect("load");
        assert_eq!(cfg.replay.timing_strategy, "speed");
        assert_eq!(cfg.replay.event_timeout_secs, 5);
        assert_eq!(cfg.replay.default_wait_ms, 100);
        assert_eq!(cfg.synthesis.runs_per_trial, 3);
        assert_eq!(cfg.synthesis.baseline_runs, 2);
    }

    #[test]
    fn unknown_strategy_in_file_is_rejected() {
        let fs = FakeFileSystem::with_file(
            "/cfg/bad.toml",
            "[replay]\nbroken_channel_strategy = \"shrug\"\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/cfg/bad.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, &fs).expect_err("invalid");
        assert!(matches!(err, ReplayError::InvalidConfig(msg) if msg.contains("broken_channel_strategy")));
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let fs = FakeFileSystem::default();
        let overrides = CliOverrides {
            timing_strategy: Some("fixed_1".to_string()),
            unattended: true,
            database_path: Some(PathBuf::from("/tmp/s.sqlite")),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, &fs).expect("load");
        assert_eq!(cfg.replay.timing_strategy, "fixed_1");
        assert!(cfg.replay.unattended);
        assert_eq!(cfg.storage.database_path, PathBuf::from("/tmp/s.sqlite"));
    }

    #[test]
    fn trial_params_slow_down_and_bound_each_event() {
        let cfg = AppConfig::default();
        let params = cfg.trial_params();
        assert_eq!(params.timing_strategy, "slower");
        assert_eq!(params.event_timeout_secs, 40);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = parse_config("[replay\n").expect_err("malformed");
        assert!(matches!(err, ReplayError::ConfigParse(_)));
    }
}
