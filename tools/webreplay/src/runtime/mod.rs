use crate::errors::ReplayError;
use crate::event::{Capture, Event, Script};
use crate::protocol::{Ack, CoreMessage, GetIdRequest, Inbound, PageMessage};
use crate::script_store::{SaveScriptRequest, ScriptVariant};
use crate::types::{AckType, PortId, RecordState, TabId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub mod stdio_host;

pub use stdio_host::StdioHost;

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn stdin_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), ReplayError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
}

/// Browser primitives plus the message transport to page-side channels.
pub trait BrowserHost: Send + Sync {
    /// Deliver a message to one port. `ChannelClosed` when the port is gone.
    fn post(&self, port: &str, message: CoreMessage) -> Result<(), ReplayError>;
    fn broadcast(&self, message: CoreMessage) -> Result<(), ReplayError>;
    /// Drain every message that arrived since the last call.
    fn poll_inbound(&self) -> Result<Vec<Inbound>, ReplayError>;
    fn open_tabs(&self) -> Result<Vec<TabId>, ReplayError>;
    fn create_tab(&self, url: &str) -> Result<TabId, ReplayError>;
    fn get_tab(&self, tab: TabId) -> Result<Option<TabInfo>, ReplayError>;
    fn remove_tab(&self, tab: TabId) -> Result<(), ReplayError>;
    /// The tab the operator most recently brought to the foreground.
    fn foreground_tab(&self) -> Result<Option<TabId>, ReplayError>;
    fn capture_screenshot(&self, tab: TabId, label: &str) -> Result<(), ReplayError>;
}

/// The person driving the browser, asked when automation cannot decide.
pub trait Operator: Send + Sync {
    fn ask(&self, prompt: &str) -> Result<String, ReplayError>;
}

pub trait ScriptStore: Send + Sync {
    /// Newest variant saved under `name`.
    fn get_script(&self, name: &str) -> Result<Script, ReplayError>;
    fn save_script(&self, request: SaveScriptRequest) -> Result<i64, ReplayError>;
    fn list_variants(&self, name: &str) -> Result<Vec<ScriptVariant>, ReplayError>;
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, ReplayError>;
    fn set(&self, key: &str, value: Value) -> Result<(), ReplayError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        std::fs::read_to_string(path).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError> {
        std::fs::write(path, contents).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError> {
        std::fs::create_dir_all(path).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdin_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdin())
    }

    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        use std::io::Write;
        let mut out = std::io::stderr();
        writeln!(out, "{line}").map_err(|e| ReplayError::Io(e.to_string()))
    }
}

/// Everything a replay or synthesis session talks to, built once at startup.
#[derive(Clone)]
pub struct ReplayRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
    pub host: Arc<dyn BrowserHost>,
    pub operator: Arc<dyn Operator>,
    pub scripts: Arc<dyn ScriptStore>,
    pub kv: Arc<dyn KeyValueStore>,
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| ReplayError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError> {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError> {
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdin_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

/// Scripted answers, handed out in order. Asking past the end is an error.
#[derive(Default, Clone)]
pub struct FakeOperator {
    answers: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeOperator {
    pub fn with_answers<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let operator = Self::default();
        operator
            .answers
            .lock()
            .expect("answers lock")
            .extend(answers.into_iter().map(Into::into));
        operator
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl Operator for FakeOperator {
    fn ask(&self, prompt: &str) -> Result<String, ReplayError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.answers
            .lock()
            .expect("answers lock")
            .pop_front()
            .ok_or_else(|| ReplayError::Host("operator has no answer".to_string()))
    }
}

#[derive(Default, Clone)]
pub struct MemoryKeyValueStore {
    values: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>, ReplayError> {
        Ok(self.values.lock().expect("kv lock").get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ReplayError> {
        self.values
            .lock()
            .expect("kv lock")
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct MemoryScriptStore {
    saved: Arc<Mutex<Vec<ScriptVariant>>>,
}

impl MemoryScriptStore {
    pub fn variants(&self) -> Vec<ScriptVariant> {
        self.saved.lock().expect("scripts lock").clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.variants().into_iter().map(|v| v.tag).collect()
    }
}

impl ScriptStore for MemoryScriptStore {
    fn get_script(&self, name: &str) -> Result<Script, ReplayError> {
        self.saved
            .lock()
            .expect("scripts lock")
            .iter()
            .rev()
            .find(|v| v.name == name)
            .map(ScriptVariant::to_script)
            .ok_or_else(|| ReplayError::ScriptNotFound(name.to_string()))
    }

    fn save_script(&self, request: SaveScriptRequest) -> Result<i64, ReplayError> {
        let mut saved = self.saved.lock().expect("scripts lock");
        let id = saved.len() as i64 + 1;
        saved.push(ScriptVariant::from_request(id, request));
        Ok(id)
    }

    fn list_variants(&self, name: &str) -> Result<Vec<ScriptVariant>, ReplayError> {
        Ok(self
            .saved
            .lock()
            .expect("scripts lock")
            .iter()
            .filter(|v| v.name == name)
            .cloned()
            .collect())
    }
}

/// How a simulated page answers a dispatched `dom` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Success,
    /// Execute only the first `n` events of the group.
    Partial(usize),
    Never,
}

#[derive(Default)]
struct FakeHostState {
    next_tab: TabId,
    tabs: BTreeMap<TabId, String>,
    foreground: Option<TabId>,
    inbound: VecDeque<Inbound>,
    posted: Vec<(PortId, CoreMessage)>,
    broadcasts: Vec<CoreMessage>,
    bound_ports: HashMap<PortId, TabId>,
    /// Tabs of frames that asked for an id, in request order.
    pending_frames: VecDeque<TabId>,
    closed_ports: HashSet<PortId>,
    created_tabs: Vec<(TabId, String)>,
    removed_tabs: Vec<TabId>,
    screenshots: Vec<(TabId, String)>,
    auto_connect: bool,
    ack_mode: Option<AckMode>,
    requests_after: HashMap<String, Vec<String>>,
    capture_texts: HashMap<String, String>,
    next_page_event: u64,
    timestamp: i64,
}

/// In-memory browser with simulated pages. New tabs connect a top frame on
/// their own, and pages execute and re-record whatever is dispatched to
/// them according to the configured [`AckMode`].
#[derive(Clone)]
pub struct FakeBrowserHost {
    state: Arc<Mutex<FakeHostState>>,
}

impl Default for FakeBrowserHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBrowserHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeHostState {
                next_tab: 100,
                auto_connect: true,
                ack_mode: Some(AckMode::Success),
                timestamp: 1_000,
                ..FakeHostState::default()
            })),
        }
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.state.lock().expect("host lock").auto_connect = enabled;
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.state.lock().expect("host lock").ack_mode = Some(mode);
    }

    /// After the page executes `event_id`, the host observes completed
    /// requests for `urls`.
    pub fn complete_requests_after(&self, event_id: &str, urls: &[&str]) {
        self.state
            .lock()
            .expect("host lock")
            .requests_after
            .insert(event_id.to_string(), urls.iter().map(|u| u.to_string()).collect());
    }

    /// Text the simulated page scrapes for capture event `event_id`.
    pub fn set_capture_text(&self, event_id: &str, text: &str) {
        self.state
            .lock()
            .expect("host lock")
            .capture_texts
            .insert(event_id.to_string(), text.to_string());
    }

    /// Open a tab as if the operator had, without asking for a frame.
    pub fn open_existing_tab(&self, url: &str) -> TabId {
        let mut state = self.state.lock().expect("host lock");
        let tab = state.next_tab;
        state.next_tab += 1;
        state.tabs.insert(tab, url.to_string());
        tab
    }

    pub fn set_foreground(&self, tab: TabId) {
        self.state.lock().expect("host lock").foreground = Some(tab);
    }

    /// Queue a frame connection request from `tab`.
    pub fn connect_frame(&self, tab: TabId, url: &str, top: bool) {
        let mut state = self.state.lock().expect("host lock");
        state.pending_frames.push_back(tab);
        state.inbound.push_back(Inbound {
            port: None,
            tab: Some(tab),
            state: None,
            message: PageMessage::GetId(GetIdRequest {
                url: url.to_string(),
                top,
            }),
        });
    }

    pub fn push_inbound(&self, inbound: Inbound) {
        self.state
            .lock()
            .expect("host lock")
            .inbound
            .push_back(inbound);
    }

    /// Simulate a page navigating away: posting to the port now fails.
    pub fn close_port(&self, port: &str) {
        self.state
            .lock()
            .expect("host lock")
            .closed_ports
            .insert(port.to_string());
    }

    pub fn posted(&self) -> Vec<(PortId, CoreMessage)> {
        self.state.lock().expect("host lock").posted.clone()
    }

    pub fn dispatched_groups(&self) -> Vec<(PortId, Vec<String>)> {
        self.posted()
            .into_iter()
            .filter_map(|(port, message)| match message {
                CoreMessage::Dom(events) => {
                    Some((port, events.into_iter().map(|e| e.meta.id).collect()))
                }
                CoreMessage::SimulateCapture(event) => Some((port, vec![event.meta.id])),
                _ => None,
            })
            .collect()
    }

    pub fn broadcasts(&self) -> Vec<CoreMessage> {
        self.state.lock().expect("host lock").broadcasts.clone()
    }

    pub fn created_tabs(&self) -> Vec<(TabId, String)> {
        self.state.lock().expect("host lock").created_tabs.clone()
    }

    pub fn removed_tabs(&self) -> Vec<TabId> {
        self.state.lock().expect("host lock").removed_tabs.clone()
    }

    pub fn screenshots(&self) -> Vec<(TabId, String)> {
        self.state.lock().expect("host lock").screenshots.clone()
    }

    fn simulate_dom(state: &mut FakeHostState, port: &str, group: Vec<Event>) {
        let Some(mode) = state.ack_mode else {
            return;
        };
        let executed = match mode {
            AckMode::Never => return,
            AckMode::Success => group.len(),
            AckMode::Partial(n) => n.min(group.len()),
        };
        let tab = state.bound_ports.get(port).copied();
        for original in group.iter().take(executed) {
            state.timestamp += 5;
            state.next_page_event += 1;
            let mut live = original.clone();
            live.data.timestamp = state.timestamp;
            live.meta.record_id = Some(original.meta.id.clone());
            live.meta.page_event_id = Some(state.next_page_event);
            live.timing = Default::default();
            state.inbound.push_back(
                Inbound::from_port(port, PageMessage::Event(live)).with_state(RecordState::Replaying),
            );
        }
        let ack_type = if executed == group.len() {
            AckType::Success
        } else {
            AckType::Partial
        };
        state.inbound.push_back(
            Inbound::from_port(
                port,
                PageMessage::Ack(Ack {
                    ack_type,
                    set_timeout: true,
                    executed: Some(executed),
                }),
            )
            .with_state(RecordState::Replaying),
        );
        for original in group.iter().take(executed) {
            Self::complete_requests(state, &original.meta.id, tab);
        }
    }

    fn simulate_capture(state: &mut FakeHostState, port: &str, event: Event) {
        if matches!(state.ack_mode, Some(AckMode::Never) | None) {
            return;
        }
        let inner_text = state
            .capture_texts
            .get(&event.meta.id)
            .cloned()
            .or_else(|| event.recorded_inner_text());
        state.inbound.push_back(
            Inbound::from_port(
                port,
                PageMessage::SaveCapture(Capture {
                    event_id: Some(event.meta.id.clone()),
                    inner_text,
                    inner_html: None,
                    node_name: Some("div".to_string()),
                }),
            )
            .with_state(RecordState::Replaying),
        );
        let tab = state.bound_ports.get(port).copied();
        Self::complete_requests(state, &event.meta.id, tab);
    }

    fn complete_requests(state: &mut FakeHostState, event_id: &str, tab: Option<TabId>) {
        let urls = state
            .requests_after
            .get(event_id)
            .cloned()
            .unwrap_or_default();
        for url in urls {
            state.timestamp += 5;
            let mut completed = Event::new(crate::event::EventKind::Completed, state.timestamp);
            completed.data.url = Some(url);
            if let Some(tab) = tab {
                completed
                    .data
                    .extra
                    .insert("tabId".to_string(), Value::from(tab));
            }
            state.inbound.push_back(Inbound::network(completed));
        }
    }
}

impl BrowserHost for FakeBrowserHost {
    fn post(&self, port: &str, message: CoreMessage) -> Result<(), ReplayError> {
        let mut state = self.state.lock().expect("host lock");
        if state.closed_ports.contains(port) {
            return Err(ReplayError::ChannelClosed(port.to_string()));
        }
        state.posted.push((port.to_string(), message.clone()));
        match message {
            CoreMessage::Id(bound) => {
                if let Some(tab) = state.pending_frames.pop_front() {
                    state.bound_ports.insert(bound, tab);
                }
            }
            CoreMessage::Dom(group) => Self::simulate_dom(&mut state, port, group),
            CoreMessage::SimulateCapture(event) => Self::simulate_capture(&mut state, port, event),
            _ => {}
        }
        Ok(())
    }

    fn broadcast(&self, message: CoreMessage) -> Result<(), ReplayError> {
        self.state
            .lock()
            .expect("host lock")
            .broadcasts
            .push(message);
        Ok(())
    }

    fn poll_inbound(&self) -> Result<Vec<Inbound>, ReplayError> {
        Ok(self
            .state
            .lock()
            .expect("host lock")
            .inbound
            .drain(..)
            .collect())
    }

    fn open_tabs(&self) -> Result<Vec<TabId>, ReplayError> {
        Ok(self
            .state
            .lock()
            .expect("host lock")
            .tabs
            .keys()
            .copied()
            .collect())
    }

    fn create_tab(&self, url: &str) -> Result<TabId, ReplayError> {
        let mut state = self.state.lock().expect("host lock");
        let tab = state.next_tab;
        state.next_tab += 1;
        state.tabs.insert(tab, url.to_string());
        state.created_tabs.push((tab, url.to_string()));
        state.foreground = Some(tab);
        if state.auto_connect {
            state.pending_frames.push_back(tab);
            state.inbound.push_back(Inbound {
                port: None,
                tab: Some(tab),
                state: None,
                message: PageMessage::GetId(GetIdRequest {
                    url: url.to_string(),
                    top: true,
                }),
            });
        }
        Ok(tab)
    }

    fn get_tab(&self, tab: TabId) -> Result<Option<TabInfo>, ReplayError> {
        Ok(self
            .state
            .lock()
            .expect("host lock")
            .tabs
            .get(&tab)
            .map(|url| TabInfo {
                id: tab,
                url: url.clone(),
            }))
    }

    fn remove_tab(&self, tab: TabId) -> Result<(), ReplayError> {
        let mut state = self.state.lock().expect("host lock");
        state.tabs.remove(&tab);
        state.removed_tabs.push(tab);
        Ok(())
    }

    fn foreground_tab(&self) -> Result<Option<TabId>, ReplayError> {
        Ok(self.state.lock().expect("host lock").foreground)
    }

    fn capture_screenshot(&self, tab: TabId, label: &str) -> Result<(), ReplayError> {
        self.state
            .lock()
            .expect("host lock")
            .screenshots
            .push((tab, label.to_string()));
        Ok(())
    }
}
