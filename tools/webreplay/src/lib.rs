pub mod config;
pub mod controller;
pub mod correspondence;
pub mod errors;
pub mod event;
pub mod event_store;
pub mod log_retention;
pub mod logging;
pub mod ports;
pub mod protocol;
pub mod replay;
pub mod runtime;
pub mod script_store;
pub mod synthesis;
pub mod timer;
pub mod timing;
pub mod types;

use clap::{error::ErrorKind, CommandFactory, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides};
use controller::Controller;
use errors::ReplayError;
use event::{Event, Script};
use logging::{append_run_log, init_run_logger, structured_fallback_line, JsonlLogger};
use runtime::{
    BrowserHost, Clock, FileSystem, KeyValueStore, Operator, ProductionClock,
    ProductionFileSystem, ProductionTerminal, ReplayRuntime, ScriptStore, StdioHost, Terminal,
};
use script_store::{SaveScriptRequest, SqliteScriptStore};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use synthesis::SynthesisSession;

#[derive(Debug, Clone, Parser)]
#[command(name = "webreplay")]
#[command(about = "Record/replay engine for browser interaction scripts")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    #[arg(long, global = true)]
    pub timing_strategy: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub unattended: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Replay the newest variant of a stored script through the page host.
    Replay {
        #[arg(long)]
        script: String,
    },
    /// Learn trigger waits for a stored script with live trials.
    Synthesize {
        #[arg(long)]
        script: String,
    },
    /// Print the events of a stored script.
    Show {
        #[arg(long)]
        script: String,
    },
    /// Store a JSON event list (or a `{name, events}` script) under a name.
    Import {
        #[arg(long)]
        script: String,
        #[arg(long)]
        file: PathBuf,
    },
}

pub type HostConnector =
    Box<dyn Fn(&AppConfig) -> Result<(Arc<dyn BrowserHost>, Arc<dyn Operator>), ReplayError>>;
pub type StoreOpener =
    Box<dyn Fn(&AppConfig) -> Result<(Arc<dyn ScriptStore>, Arc<dyn KeyValueStore>), ReplayError>>;

/// Process-level collaborators. The page host is only connected for
/// commands that drive pages.
pub struct CliEnvironment {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
    pub connect_host: HostConnector,
    pub open_store: StoreOpener,
}

impl CliEnvironment {
    pub fn production() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
            connect_host: Box::new(|cfg: &AppConfig| {
                let host = Arc::new(StdioHost::from_stdio(
                    cfg.storage.screenshot_dir.clone(),
                    cfg.storage.screenshot_budget_bytes,
                ));
                Ok((host.clone() as Arc<dyn BrowserHost>, host as Arc<dyn Operator>))
            }),
            open_store: Box::new(|cfg: &AppConfig| {
                if let Some(parent) = cfg.storage.database_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
                }
                let store = Arc::new(SqliteScriptStore::open(&cfg.storage.database_path)?);
                Ok((store.clone() as Arc<dyn ScriptStore>, store as Arc<dyn KeyValueStore>))
            }),
        }
    }

    fn replay_runtime(&self, cfg: &AppConfig) -> Result<ReplayRuntime, ReplayError> {
        let (scripts, kv) = (self.open_store)(cfg)?;
        let (host, operator) = (self.connect_host)(cfg)?;
        Ok(ReplayRuntime {
            clock: self.clock.clone(),
            file_system: self.file_system.clone(),
            terminal: self.terminal.clone(),
            host,
            operator,
            scripts,
            kv,
        })
    }
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    run_with_runtime(&args, &CliEnvironment::production())
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &CliEnvironment,
) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        database_path: cli.database.clone(),
        timing_strategy: cli.timing_strategy.clone(),
        unattended: cli.unattended,
    };
    let cfg = load_config(&overrides, env.file_system.as_ref())?;
    init_run_logger(JsonlLogger {
        path: cfg.logging.path.clone(),
        max_payload_bytes: cfg.logging.max_payload_bytes,
        budget_bytes: cfg.logging.budget_bytes,
    });
    append_run_log(
        "info",
        "cli.started",
        json!({"command": command_name(&cli.command), "database": cfg.storage.database_path}),
    );

    match &cli.command {
        Command::Show { script } => {
            let (scripts, _) = (env.open_store)(&cfg)?;
            show_script(env.terminal.as_ref(), &scripts.get_script(script)?)?;
            Ok(0)
        }
        Command::Import { script, file } => {
            let (scripts, _) = (env.open_store)(&cfg)?;
            let contents = env.file_system.read_to_string(file)?;
            let events = parse_import(&contents)?;
            let count = events.len();
            let id = scripts.save_script(SaveScriptRequest {
                name: script.clone(),
                events,
                tag: "import".to_string(),
                ..SaveScriptRequest::default()
            })?;
            report(
                env.terminal.as_ref(),
                "import",
                "complete",
                &format!("script={script} id={id} events={count}"),
            )?;
            Ok(0)
        }
        Command::Replay { script } => {
            let rt = env.replay_runtime(&cfg)?;
            let mut controller = Controller::new(rt, cfg.clone());
            controller.get_script(script)?;
            controller.replay_recording(None);
            let Some(run) = controller.run_replay(None)? else {
                return Err(ReplayError::InvalidState(
                    "replay returned without completing".to_string(),
                ));
            };
            let state = if run.is_error() { "error" } else { "complete" };
            report(
                env.terminal.as_ref(),
                "replay",
                state,
                &format!(
                    "script={script} index={}/{} captures={} elapsed_ms={} element_timeouts={} trigger_timeouts={}{}",
                    run.index,
                    controller.recording().len(),
                    run.captures.len(),
                    run.elapsed_ms,
                    run.element_timeouts,
                    run.trigger_timeouts,
                    run.error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default(),
                ),
            )?;
            Ok(if run.is_error() { 1 } else { 0 })
        }
        Command::Synthesize { script } => {
            let rt = env.replay_runtime(&cfg)?;
            let mut session = SynthesisSession::new(rt, cfg.clone());
            let report_value = session.run(script)?;
            let accepted = report_value
                .accepted
                .iter()
                .filter(|d| matches!(d, synthesis::WaitDelta::AddTrigger { .. }))
                .count();
            report(
                env.terminal.as_ref(),
                "synthesize",
                "complete",
                &format!(
                    "script={script} suite_id={} final_id={} baselines={} trials={} triggers={accepted}",
                    report_value.suite_id,
                    report_value.final_script_id,
                    report_value.baseline_runs,
                    report_value.trials.iter().filter(|t| t.ran).count(),
                ),
            )?;
            Ok(0)
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Replay { .. } => "replay",
        Command::Synthesize { .. } => "synthesize",
        Command::Show { .. } => "show",
        Command::Import { .. } => "import",
    }
}

/// Human line on a terminal, `key=value` line otherwise.
fn report(terminal: &dyn Terminal, role: &str, state: &str, message: &str) -> Result<(), ReplayError> {
    if terminal.stdin_is_tty() {
        terminal.write_line(&format!("{role} {state}: {message}"))
    } else {
        terminal.write_line(&structured_fallback_line(role, state, message))
    }
}

fn show_script(terminal: &dyn Terminal, script: &Script) -> Result<(), ReplayError> {
    terminal.write_line(&format!(
        "{} (id {}) {} events",
        script.name,
        script.id.map_or_else(|| "-".to_string(), |id| id.to_string()),
        script.events.len()
    ))?;
    for (index, event) in script.events.iter().enumerate() {
        let mut line = format!(
            "{index:>4} {:<10} {:<9} wait={}ms",
            event.meta.id,
            event.kind.as_str(),
            event.timing.wait_time
        );
        if let Some(url) = &event.data.url {
            line.push_str(&format!(" url={url}"));
        }
        if let Some(trigger) = &event.timing.wait_event {
            line.push_str(&format!(" trigger={trigger}"));
        }
        terminal.write_line(&line)?;
    }
    Ok(())
}

/// Accepts a bare event array or an object carrying an `events` array.
pub fn parse_import(contents: &str) -> Result<Vec<Event>, ReplayError> {
    let value: Value = serde_json::from_str(contents)
        .map_err(|e| ReplayError::Cli(format!("import file is not JSON: {e}")))?;
    let events = match value {
        Value::Array(_) => value,
        Value::Object(mut obj) => obj
            .remove("events")
            .ok_or_else(|| ReplayError::Cli("import object has no `events` array".to_string()))?,
        _ => {
            return Err(ReplayError::Cli(
                "import file must hold an event array".to_string(),
            ))
        }
    };
    serde_json::from_value(events).map_err(|e| ReplayError::Cli(format!("invalid event: {e}")))
}

pub fn render_help() -> String {
    let mut cmd = Cli::command();
    let mut buffer = Vec::new();
    cmd.write_long_help(&mut buffer).expect("write help to vec");
    String::from_utf8(buffer).expect("utf8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_accepts_arrays_and_script_objects() {
        let array = r#"[{"type":"dom","data":{"timeStamp":1},"meta":{"id":"event0"}}]"#;
        assert_eq!(parse_import(array).expect("array")[0].meta.id, "event0");

        let object = r#"{"name":"login","events":[{"type":"completed","data":{"timeStamp":2,"url":"http://a.test/"}}]}"#;
        let events = parse_import(object).expect("object");
        assert_eq!(events[0].data.url.as_deref(), Some("http://a.test/"));

        assert!(matches!(parse_import("42"), Err(ReplayError::Cli(_))));
        assert!(matches!(parse_import(r#"{"name":"x"}"#), Err(ReplayError::Cli(_))));
    }

    #[test]
    fn help_lists_subcommands() {
        let help = render_help();
        for command in ["replay", "synthesize", "show", "import"] {
            assert!(help.contains(command), "missing {command}");
        }
        assert!(help.contains("--database"));
    }
}
