use crate::config::ReplayParams;
use crate::errors::ReplayError;
use crate::event::{Event, FrameInfo};
use crate::logging::append_run_log;
use crate::ports::PortTable;
use crate::runtime::{BrowserHost, Operator};
use crate::types::{PortId, TabId};
use serde_json::json;
use std::collections::{HashMap, HashSet};

pub const TAB_QUESTION: &str =
    "Does the page exist? If so select the tab then type 'yes'. Else type 'no'.";

/// Events recorded without a tab share this slot in the tab mapping.
const UNKNOWN_TAB: TabId = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Dispatch to this live port now.
    Port(PortId),
    /// No destination yet; try again after this many milliseconds.
    Wait(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TabAnswer {
    Yes,
    No,
}

fn yes_no(answer: &str) -> Option<TabAnswer> {
    match answer.trim() {
        "yes" | "y" => Some(TabAnswer::Yes),
        "no" | "n" => Some(TabAnswer::No),
        _ => None,
    }
}

/// Collaborators a resolution may need.
pub struct ResolveContext<'a> {
    pub ports: &'a mut PortTable,
    pub host: &'a dyn BrowserHost,
    pub operator: &'a dyn Operator,
    pub params: &'a ReplayParams,
    pub first_event_replayed: bool,
}

/// Recorded-to-live port and tab mappings for one replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correspondence {
    pub port_mapping: HashMap<PortId, PortId>,
    pub tab_mapping: HashMap<TabId, TabId>,
    pub last_tab: Option<TabId>,
}

impl Correspondence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(
        frame_mapping: &HashMap<PortId, PortId>,
        tab_mapping: &HashMap<TabId, TabId>,
    ) -> Self {
        Self {
            port_mapping: frame_mapping.clone(),
            tab_mapping: tab_mapping.clone(),
            ..Self::default()
        }
    }

    /// Drop a stale port mapping so the next resolution re-matches.
    pub fn forget_port(&mut self, recorded_port: &str) -> Option<PortId> {
        self.port_mapping.remove(recorded_port)
    }

    pub fn resolve(
        &mut self,
        event: &Event,
        cx: &mut ResolveContext<'_>,
    ) -> Result<Resolution, ReplayError> {
        let frame = &event.frame;
        let recorded_port = frame.port.clone().unwrap_or_default();
        let recorded_tab = frame.tab.unwrap_or(UNKNOWN_TAB);

        if let Some(live) = self.port_mapping.get(&recorded_port) {
            return Ok(Resolution::Port(live.clone()));
        }

        if let Some(&live_tab) = self.tab_mapping.get(&recorded_tab) {
            return Ok(match find_port_in_tab(cx.ports, live_tab, frame) {
                Some(live) => {
                    append_run_log(
                        "debug",
                        "ports.port_mapped",
                        json!({"recorded": recorded_port, "live": live, "tab": live_tab}),
                    );
                    self.port_mapping.insert(recorded_port, live.clone());
                    Resolution::Port(live)
                }
                None => Resolution::Wait(cx.params.default_wait_ms),
            });
        }

        let claimed = self.tab_mapping.values().copied().collect::<HashSet<_>>();
        let unused = cx
            .ports
            .known_tabs()
            .into_iter()
            .filter(|tab| !claimed.contains(tab))
            .collect::<Vec<_>>();

        // Best effort: a single unclaimed tab after the replay started is
        // most likely one the page opened itself. Tab churn can fool this.
        if cx.first_event_replayed && unused.len() == 1 {
            let live_tab = unused[0];
            self.map_tab(recorded_tab, live_tab, "single_unused_tab");
            return Ok(Resolution::Wait(0));
        }

        if !cx.first_event_replayed || cx.params.open_new_tab {
            return self.open_new_tab(recorded_tab, frame, cx);
        }

        match self.ask_operator(cx) {
            TabAnswer::No => self.open_new_tab(recorded_tab, frame, cx),
            TabAnswer::Yes => match cx.host.foreground_tab()? {
                Some(live_tab) => {
                    self.map_tab(recorded_tab, live_tab, "operator");
                    Ok(Resolution::Wait(0))
                }
                None => Ok(Resolution::Wait(cx.params.default_wait_ms)),
            },
        }
    }

    fn map_tab(&mut self, recorded: TabId, live: TabId, reason: &str) {
        append_run_log(
            "info",
            "ports.tab_mapped",
            json!({"recorded": recorded, "live": live, "reason": reason}),
        );
        self.tab_mapping.insert(recorded, live);
        self.last_tab = Some(live);
    }

    fn open_new_tab(
        &mut self,
        recorded_tab: TabId,
        frame: &FrameInfo,
        cx: &mut ResolveContext<'_>,
    ) -> Result<Resolution, ReplayError> {
        let url = frame
            .top_url
            .as_deref()
            .or(frame.url.as_deref())
            .ok_or_else(|| ReplayError::Host("recorded frame has no URL to open".to_string()))?;
        let live_tab = cx.host.create_tab(url)?;
        cx.ports.note_tab(live_tab);
        self.map_tab(recorded_tab, live_tab, "opened");
        Ok(Resolution::Wait(cx.params.default_wait_new_tab_ms))
    }

    fn ask_operator(&self, cx: &ResolveContext<'_>) -> TabAnswer {
        if cx.params.unattended {
            return TabAnswer::No;
        }
        loop {
            match cx.operator.ask(TAB_QUESTION) {
                Ok(answer) => {
                    if let Some(parsed) = yes_no(&answer) {
                        return parsed;
                    }
                }
                Err(err) => {
                    append_run_log(
                        "warn",
                        "ports.operator_unavailable",
                        json!({"error": err.to_string()}),
                    );
                    return TabAnswer::No;
                }
            }
        }
    }
}

/// URLs match when they agree up to the fragment.
pub fn urls_match(a: &str, b: &str) -> bool {
    fn strip(url: &str) -> &str {
        url.split('#').next().unwrap_or(url)
    }
    strip(a) == strip(b)
}

/// Find the live port in `tab` playing the role `frame` had when recorded.
/// Several same-URL iframes are ambiguous and resolve to nothing.
pub fn find_port_in_tab(ports: &PortTable, tab: TabId, frame: &FrameInfo) -> Option<PortId> {
    let view = ports.tab_view(tab)?;
    let recorded_url = frame.url.as_deref().or(frame.top_url.as_deref())?;

    if frame.top_frame {
        return view
            .top
            .filter(|top| urls_match(recorded_url, &top.url))
            .map(|top| top.port);
    }

    let matching = view
        .frames
        .into_iter()
        .filter(|f| f.url == recorded_url)
        .collect::<Vec<_>>();
    match matching.as_slice() {
        [only] => Some(only.port.clone()),
        [] => None,
        many => {
            append_run_log(
                "warn",
                "ports.ambiguous_iframes",
                json!({"tab": tab, "url": recorded_url, "count": many.len()}),
            );
            None
        }
    }
}
