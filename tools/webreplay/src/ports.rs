//! Live port and tab identity table shared by the record and replay roles.

use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::protocol::{CoreMessage, Inbound, PageMessage};
use crate::runtime::BrowserHost;
use crate::types::{PortId, TabId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};

/// What a frame reports about itself when it asks for a port id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    #[serde(default)]
    pub port: PortId,
    #[serde(rename = "URL")]
    pub url: String,
    pub top: bool,
}

/// Frame identity stamped onto events that arrive from a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOrigin {
    pub port: PortId,
    pub tab: TabId,
    pub top_url: Option<String>,
    pub top_frame: bool,
    pub iframe_index: i64,
}

/// Snapshot of the frames currently known for one tab.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TabView {
    pub top: Option<FrameDescriptor>,
    pub frames: Vec<FrameDescriptor>,
}

#[derive(Debug, Clone, Default)]
struct TabFrames {
    /// Every top frame the tab has had; the newest is the current page.
    top: Vec<PortId>,
    frames: Vec<PortId>,
}

#[derive(Debug, Default)]
pub struct PortTable {
    issued: u64,
    port_tab: HashMap<PortId, TabId>,
    port_info: HashMap<PortId, FrameDescriptor>,
    connected: HashSet<PortId>,
    tabs: BTreeMap<TabId, TabFrames>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a fresh port id to a frame in `tab` and mark it connected.
    pub fn register(&mut self, tab: TabId, url: impl Into<String>, top: bool) -> PortId {
        self.issued += 1;
        let port = self.issued.to_string();
        let descriptor = FrameDescriptor {
            port: port.clone(),
            url: url.into(),
            top,
        };

        self.port_tab.insert(port.clone(), tab);
        self.port_info.insert(port.clone(), descriptor.clone());
        self.connected.insert(port.clone());
        let frames = self.tabs.entry(tab).or_default();
        if top {
            frames.top.push(port.clone());
        } else {
            frames.frames.push(port.clone());
        }

        append_run_log(
            "debug",
            "ports.registered",
            json!({"port": port, "tab": tab, "url": descriptor.url, "top": top}),
        );
        port
    }

    /// Drop a port whose page went away. Its tab keeps its other frames.
    pub fn disconnect(&mut self, port: &str) -> bool {
        if !self.connected.remove(port) {
            return false;
        }
        if let Some(tab) = self.port_tab.get(port) {
            if let Some(frames) = self.tabs.get_mut(tab) {
                frames.top.retain(|p| p != port);
                frames.frames.retain(|p| p != port);
            }
        }
        append_run_log("debug", "ports.disconnected", json!({"port": port}));
        true
    }

    pub fn is_connected(&self, port: &str) -> bool {
        self.connected.contains(port)
    }

    pub fn update_url(&mut self, port: &str, url: impl Into<String>) {
        if let Some(info) = self.port_info.get_mut(port) {
            info.url = url.into();
        }
    }

    /// Record a tab the replay opened before any frame in it has connected.
    pub fn note_tab(&mut self, tab: TabId) {
        self.tabs.entry(tab).or_default();
    }

    pub fn remove_tab(&mut self, tab: TabId) {
        if let Some(frames) = self.tabs.remove(&tab) {
            for port in frames.top.iter().chain(frames.frames.iter()) {
                self.connected.remove(port);
            }
        }
    }

    /// Forget every tab the host no longer reports as open.
    pub fn prune_removed(&mut self, open_tabs: &[TabId]) {
        let open = open_tabs.iter().copied().collect::<HashSet<_>>();
        let stale = self
            .tabs
            .keys()
            .copied()
            .filter(|tab| !open.contains(tab))
            .collect::<Vec<_>>();
        for tab in stale {
            self.remove_tab(tab);
        }
    }

    pub fn known_tabs(&self) -> Vec<TabId> {
        self.tabs.keys().copied().collect()
    }

    pub fn connected_ports(&self) -> Vec<PortId> {
        let mut ports = self.connected.iter().cloned().collect::<Vec<_>>();
        ports.sort();
        ports
    }

    pub fn tab_of(&self, port: &str) -> Option<TabId> {
        self.port_tab.get(port).copied()
    }

    pub fn tab_view(&self, tab: TabId) -> Option<TabView> {
        let frames = self.tabs.get(&tab)?;
        let describe = |port: &PortId| self.port_info.get(port).cloned();
        Some(TabView {
            top: frames.top.last().and_then(describe),
            frames: frames.frames.iter().filter_map(describe).collect(),
        })
    }

    /// Handle port lifecycle messages (`getId`, `url`, `disconnect`) and hand
    /// every other message back to the caller.
    pub fn apply(
        &mut self,
        inbound: Inbound,
        host: &dyn BrowserHost,
    ) -> Result<Option<Inbound>, ReplayError> {
        match &inbound.message {
            PageMessage::GetId(request) => {
                let Some(tab) = inbound.tab else {
                    append_run_log(
                        "warn",
                        "ports.get_id.no_tab",
                        json!({"url": request.url}),
                    );
                    return Ok(None);
                };
                let port = self.register(tab, request.url.clone(), request.top);
                host.post(&port, CoreMessage::Id(port.clone()))?;
                Ok(None)
            }
            PageMessage::Url(url) => {
                if let Some(port) = inbound.port.as_deref() {
                    self.update_url(port, url.clone());
                }
                Ok(None)
            }
            PageMessage::Disconnect => {
                if let Some(port) = inbound.port.as_deref() {
                    self.disconnect(port);
                }
                Ok(None)
            }
            _ => Ok(Some(inbound)),
        }
    }

    /// Frame identity for an event raised by `port`.
    pub fn origin_of(&self, port: &str) -> Option<FrameOrigin> {
        let tab = self.tab_of(port)?;
        let view = self.tab_view(tab)?;
        let top_frame = view.top.as_ref().is_some_and(|top| top.port == port);
        let iframe_index = if top_frame {
            -1
        } else {
            view.frames
                .iter()
                .position(|frame| frame.port == port)
                .map_or(-1, |i| i as i64)
        };
        Some(FrameOrigin {
            port: port.to_string(),
            tab,
            top_url: view.top.map(|top| top.url),
            top_frame,
            iframe_index,
        })
    }
}
