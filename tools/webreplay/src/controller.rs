//! Record and replay roles behind one set of operations.
//!
//! The controller owns the port table, the recording in progress and the
//! replay engine. Page messages are routed by the state the page reported:
//! replay traffic goes to the engine, recording traffic to the event store,
//! and everything else is answered here.

use crate::config::AppConfig;
use crate::errors::ReplayError;
use crate::event::{Event, Script};
use crate::event_store::EventStore;
use crate::logging::append_run_log;
use crate::ports::PortTable;
use crate::protocol::{CoreMessage, Inbound, PageMessage};
use crate::replay::{Continuation, ReplayConfig, ReplayEngine, ReplayRun};
use crate::runtime::ReplayRuntime;
use crate::script_store::SaveScriptRequest;
use crate::types::RecordState;
use serde_json::{json, Value};
use std::time::SystemTime;

pub const SCRIPT_NAME_KEY: &str = "scriptName";

pub struct Controller {
    rt: ReplayRuntime,
    config: AppConfig,
    ports: PortTable,
    record: EventStore,
    replay: ReplayEngine,
}

impl Controller {
    pub fn new(rt: ReplayRuntime, config: AppConfig) -> Self {
        let replay = ReplayEngine::new(config.replay.clone());
        Self::with_engine(rt, config, replay)
    }

    pub fn with_engine(rt: ReplayRuntime, config: AppConfig, replay: ReplayEngine) -> Self {
        Self {
            rt,
            config,
            ports: PortTable::new(),
            record: EventStore::new(),
            replay,
        }
    }

    pub fn runtime(&self) -> &ReplayRuntime {
        &self.rt
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn recording(&self) -> &EventStore {
        &self.record
    }

    pub fn engine(&self) -> &ReplayEngine {
        &self.replay
    }

    pub fn engine_mut(&mut self) -> &mut ReplayEngine {
        &mut self.replay
    }

    pub fn start(&mut self) {
        append_run_log("info", "controller.start", json!({}));
        self.record.set_state(RecordState::Recording);
        self.broadcast(CoreMessage::Recording(RecordState::Recording));
    }

    pub fn stop(&mut self) {
        append_run_log("info", "controller.stop", json!({"events": self.record.len()}));
        self.record.set_state(RecordState::Stopped);
        self.broadcast(CoreMessage::Recording(RecordState::Stopped));
    }

    pub fn reset(&mut self) {
        append_run_log("info", "controller.reset", json!({}));
        self.replay.pause(&self.rt);
        self.record.reset();
        self.broadcast(CoreMessage::Reset);
    }

    /// Replay whatever is currently recorded or loaded.
    pub fn replay_recording(&mut self, continuation: Option<Continuation>) {
        self.stop();
        let config = ReplayConfig {
            script_id: self.record.script_id(),
            ..ReplayConfig::default()
        };
        let events = self.record.snapshot();
        self.replay.replay(&self.rt, events, config, continuation);
    }

    pub fn replay_script(
        &mut self,
        events: Vec<Event>,
        config: ReplayConfig,
        continuation: Option<Continuation>,
    ) {
        self.replay.replay(&self.rt, events, config, continuation);
    }

    pub fn pause(&mut self) {
        self.replay.pause(&self.rt);
    }

    pub fn restart(&mut self) {
        self.replay.restart(&self.rt);
    }

    pub fn skip(&mut self) {
        self.replay.skip();
    }

    pub fn resend(&mut self) {
        self.replay.resend();
    }

    /// Persist the current recording as a new variant of `name`.
    pub fn save_script(&mut self, name: &str) -> Result<i64, ReplayError> {
        let id = self.rt.scripts.save_script(SaveScriptRequest {
            name: name.to_string(),
            events: self.record.snapshot(),
            source_id: self.record.script_id(),
            tag: "recording".to_string(),
            params: serde_json::to_value(&self.config.replay).ok(),
            ..SaveScriptRequest::default()
        })?;
        self.record.set_script_id(Some(id));
        self.rt.kv.set(SCRIPT_NAME_KEY, Value::from(name))?;
        Ok(id)
    }

    /// Load the newest variant of `name` into the recording.
    pub fn get_script(&mut self, name: &str) -> Result<Script, ReplayError> {
        let script = self.rt.scripts.get_script(name)?;
        self.record.set_events(script.events.clone());
        self.record.set_script_id(script.id);
        self.rt.kv.set(SCRIPT_NAME_KEY, Value::from(name))?;
        append_run_log(
            "info",
            "controller.script_loaded",
            json!({"name": name, "id": script.id, "events": script.events.len()}),
        );
        Ok(script)
    }

    pub fn last_script_name(&self) -> Result<Option<String>, ReplayError> {
        Ok(self
            .rt
            .kv
            .get(SCRIPT_NAME_KEY)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Adopt new configuration and push the snapshot to every page.
    pub fn update_params(&mut self, config: AppConfig) {
        self.replay.set_params(config.replay.clone());
        self.config = config;
        self.broadcast(CoreMessage::Params(params_snapshot(&self.config)));
    }

    /// Drain page messages once and run whatever the engine has due.
    pub fn poll_once(&mut self) -> Result<(), ReplayError> {
        for inbound in self.rt.host.poll_inbound()? {
            let Some(inbound) = self.ports.apply(inbound, self.rt.host.as_ref())? else {
                continue;
            };
            if self.replay.accepts(&inbound) {
                self.replay.handle_inbound(&self.rt, &self.ports, inbound);
            } else {
                route_outside_replay(&mut self.record, &self.rt, &self.config, &self.ports, inbound);
            }
        }
        self.replay.step(&self.rt, &mut self.ports);
        Ok(())
    }

    /// Keep routing messages until the running replay completes or
    /// `deadline` passes.
    pub fn run_replay(
        &mut self,
        deadline: Option<SystemTime>,
    ) -> Result<Option<ReplayRun>, ReplayError> {
        let Self {
            rt,
            config,
            ports,
            record,
            replay,
        } = self;
        replay.drive_with(rt, ports, deadline, &mut |ports, inbound| {
            route_outside_replay(record, rt, config, ports, inbound);
        })
    }

    fn broadcast(&self, message: CoreMessage) {
        let kind = message.kind();
        if let Err(err) = self.rt.host.broadcast(message) {
            append_run_log(
                "warn",
                "controller.broadcast_failed",
                json!({"type": kind, "error": err.to_string()}),
            );
        }
    }
}

pub fn params_snapshot(config: &AppConfig) -> Value {
    serde_json::to_value(config).unwrap_or(Value::Null)
}

/// Recording traffic and general page requests.
fn route_outside_replay(
    record: &mut EventStore,
    rt: &ReplayRuntime,
    config: &AppConfig,
    ports: &PortTable,
    inbound: Inbound,
) {
    let recording = record.state() == RecordState::Recording;
    let port = inbound.port;
    match inbound.message {
        PageMessage::Event(event) | PageMessage::Capture(event) => {
            if !recording {
                append_run_log(
                    "debug",
                    "record.event.dropped",
                    json!({"port": port, "type": event.kind.as_str()}),
                );
                return;
            }
            let origin = port.as_deref().and_then(|p| ports.origin_of(p));
            record.append(event, origin.as_ref(), None);
        }
        PageMessage::UpdateEvent(update) => {
            let Some(port) = port else {
                return;
            };
            if let Err(err) = record.update_event(&port, update.page_event_id, &update.updates) {
                append_run_log(
                    "warn",
                    "record.update_event.unmatched",
                    json!({"port": port, "error": err.to_string()}),
                );
            }
        }
        PageMessage::Alert(text) => {
            append_run_log("info", "controller.alert", json!({"port": port, "text": text}));
            if let Err(err) = rt.terminal.write_line(&format!("alert: {text}")) {
                append_run_log("warn", "controller.alert_failed", json!({"error": err.to_string()}));
            }
        }
        PageMessage::GetRecording => {
            reply(rt, port.as_deref(), CoreMessage::Recording(record.state()));
        }
        PageMessage::GetParams => {
            reply(rt, port.as_deref(), CoreMessage::Params(params_snapshot(config)));
        }
        PageMessage::Prompt(question) => match rt.operator.ask(&question) {
            Ok(answer) => reply(rt, port.as_deref(), CoreMessage::PromptResponse(answer)),
            Err(err) => append_run_log(
                "warn",
                "controller.prompt.unanswered",
                json!({"error": err.to_string()}),
            ),
        },
        other => append_run_log(
            "debug",
            "controller.inbound.ignored",
            json!({"type": other.kind(), "port": port}),
        ),
    }
}

fn reply(rt: &ReplayRuntime, port: Option<&str>, message: CoreMessage) {
    let Some(port) = port else {
        return;
    };
    let kind = message.kind();
    if let Err(err) = rt.host.post(port, message) {
        append_run_log(
            "warn",
            "controller.reply_failed",
            json!({"port": port, "type": kind, "error": err.to_string()}),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::runtime::{
        FakeBrowserHost, FakeClock, FakeFileSystem, FakeOperator, FakeTerminal,
        MemoryKeyValueStore, MemoryScriptStore,
    };
    use std::sync::Arc;

    fn controller(operator: FakeOperator) -> (Controller, FakeBrowserHost, MemoryScriptStore) {
        let host = FakeBrowserHost::new();
        let scripts = MemoryScriptStore::default();
        let rt = ReplayRuntime {
            clock: Arc::new(FakeClock::default()),
            file_system: Arc::new(FakeFileSystem::default()),
            terminal: Arc::new(FakeTerminal::default()),
            host: Arc::new(host.clone()),
            operator: Arc::new(operator),
            scripts: Arc::new(scripts.clone()),
            kv: Arc::new(MemoryKeyValueStore::default()),
        };
        (Controller::new(rt, AppConfig::default()), host, scripts)
    }

    fn page_event(timestamp: i64) -> PageMessage {
        PageMessage::Event(Event::new(EventKind::Dom, timestamp))
    }

    #[test]
    fn recording_stamps_frames_and_waits() {
        let (mut c, host, _) = controller(FakeOperator::default());
        host.connect_frame(3, "http://a.test/", true);
        c.poll_once().expect("poll");
        c.start();

        host.push_inbound(Inbound::from_port("1", page_event(100)).with_state(RecordState::Recording));
        host.push_inbound(Inbound::from_port("1", page_event(350)).with_state(RecordState::Recording));
        c.poll_once().expect("poll");

        let events = c.recording().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frame.tab, Some(3));
        assert_eq!(events[0].frame.top_url.as_deref(), Some("http://a.test/"));
        assert_eq!(events[1].timing.wait_time, 250);
        assert_eq!(events[1].meta.id, "event1");
    }

    #[test]
    fn events_are_dropped_when_not_recording() {
        let (mut c, host, _) = controller(FakeOperator::default());
        host.push_inbound(Inbound::from_port("1", page_event(1)));
        c.poll_once().expect("poll");
        assert!(c.recording().is_empty());
    }

    #[test]
    fn saved_script_reloads_and_remembers_its_name() {
        let (mut c, host, scripts) = controller(FakeOperator::default());
        c.start();
        host.push_inbound(Inbound::network(Event::new(EventKind::Completed, 5)));
        c.poll_once().expect("poll");
        let id = c.save_script("login").expect("save");
        assert_eq!(scripts.variants()[0].id, id);

        c.reset();
        assert!(c.recording().is_empty());
        let script = c.get_script("login").expect("load");
        assert_eq!(script.events.len(), 1);
        assert_eq!(c.recording().script_id(), Some(id));
        assert_eq!(c.last_script_name().expect("kv"), Some("login".to_string()));
    }

    #[test]
    fn general_requests_are_answered_on_the_asking_port() {
        let (mut c, host, _) = controller(FakeOperator::with_answers(["42"]));
        host.push_inbound(Inbound::from_port("9", PageMessage::GetRecording));
        host.push_inbound(Inbound::from_port("9", PageMessage::Prompt("answer?".to_string())));
        c.poll_once().expect("poll");
        let posted = host.posted();
        assert_eq!(
            posted[0],
            ("9".to_string(), CoreMessage::Recording(RecordState::Stopped))
        );
        assert_eq!(
            posted[1],
            ("9".to_string(), CoreMessage::PromptResponse("42".to_string()))
        );
    }

    #[test]
    fn params_update_reaches_every_page() {
        let (mut c, host, _) = controller(FakeOperator::default());
        let mut config = AppConfig::default();
        config.replay.timing_strategy = "speed".to_string();
        c.update_params(config);
        assert_eq!(c.engine().params().timing_strategy, "speed");
        let Some(CoreMessage::Params(snapshot)) = host.broadcasts().pop() else {
            panic!("expected params broadcast");
        };
        assert_eq!(snapshot["replay"]["timing_strategy"], "speed");
    }

    #[test]
    fn recorded_session_replays_through_the_controller() {
        let (mut c, host, scripts) = controller(FakeOperator::default());
        let tab = host.open_existing_tab("http://a.test/");
        host.connect_frame(tab, "http://a.test/", true);
        c.poll_once().expect("poll");
        c.start();
        host.push_inbound(Inbound::from_port("1", page_event(10)).with_state(RecordState::Recording));
        c.poll_once().expect("poll");
        c.save_script("demo").expect("save");

        c.replay_recording(None);
        let run = c.run_replay(None).expect("drive").expect("finished");
        assert_eq!(run.error, None);
        assert_eq!(run.events.len(), 1);
        assert_eq!(host.created_tabs().len(), 1);
        assert!(scripts.tags().contains(&"replay".to_string()));
    }
}
