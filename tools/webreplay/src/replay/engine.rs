//! Replay state machine.
//!
//! A replay is driven by one cancellable wake-up. Each time it fires the
//! engine runs one step ("guts"): it handles timeouts and pending
//! acknowledgments, or resolves and dispatches the event at the current
//! index, then re-arms itself. Messages from pages are fed in between steps
//! through [`ReplayEngine::handle_inbound`].

use crate::config::ReplayParams;
use crate::correspondence::{Correspondence, ResolveContext, Resolution};
use crate::errors::ReplayError;
use crate::event::{Capture, Event, EventKind};
use crate::event_store::EventStore;
use crate::logging::append_run_log;
use crate::ports::PortTable;
use crate::protocol::{Ack, CoreMessage, Inbound, PageMessage};
use crate::replay::run::ReplayRun;
use crate::replay::trigger::conditions_met;
use crate::runtime::ReplayRuntime;
use crate::script_store::SaveScriptRequest;
use crate::timer::Timer;
use crate::timing::{next_delay, TimingOverride};
use crate::types::{
    AckType, BrokenChannelStrategy, PartialAckStrategy, PortId, RecordState, ReplayState,
    TabId, TimingStrategy,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// How often the drive loop looks for page messages while nothing is due.
pub const POLL_INTERVAL_MS: u64 = 50;

/// Called once with the finished run.
pub type Continuation = Box<dyn FnOnce(&ReplayRun) + Send>;

#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Script the replayed events came from; re-recordings are saved under it.
    pub script_id: Option<i64>,
    /// Recorded-port to live-port pairs known before the replay starts.
    pub frame_mapping: HashMap<PortId, PortId>,
    /// Recorded-tab to live-tab pairs known before the replay starts.
    pub tab_mapping: HashMap<TabId, TabId>,
}

/// The group most recently sent to a page.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    start: usize,
    len: usize,
    capture: bool,
}

/// Everything that belongs to one replay. Sub-replays swap it out whole.
#[derive(Default)]
struct RunState {
    state: ReplayState,
    script_id: Option<i64>,
    events: Vec<Event>,
    index: usize,
    correspondence: Correspondence,
    in_flight: Option<InFlight>,
    ack: Option<Ack>,
    first_event_replayed: bool,
    record: EventStore,
    captures: Vec<Capture>,
    timer: Timer,
    /// Index the per-event clocks are measuring and when it became current.
    index_clock: Option<(usize, SystemTime)>,
    started_at: Option<SystemTime>,
    elapsed_ms: u64,
    error: Option<String>,
    element_timeouts: u32,
    trigger_timeouts: u32,
    finish_at: Option<SystemTime>,
    continuation: Option<Continuation>,
}

pub struct ReplayEngine {
    params: ReplayParams,
    overrides: Vec<Box<dyn TimingOverride>>,
    rng: StdRng,
    run: RunState,
    last_run: Option<ReplayRun>,
}

impl ReplayEngine {
    pub fn new(params: ReplayParams) -> Self {
        Self::with_rng(params, StdRng::from_os_rng())
    }

    pub fn with_rng(params: ReplayParams, rng: StdRng) -> Self {
        Self {
            params,
            overrides: Vec::new(),
            rng,
            run: RunState::default(),
            last_run: None,
        }
    }

    pub fn params(&self) -> &ReplayParams {
        &self.params
    }

    pub fn set_params(&mut self, params: ReplayParams) {
        self.params = params;
    }

    pub fn add_timing_override(&mut self, timing_override: Box<dyn TimingOverride>) {
        self.overrides.push(timing_override);
    }

    pub fn state(&self) -> ReplayState {
        self.run.state
    }

    pub fn index(&self) -> usize {
        self.run.index
    }

    pub fn correspondence(&self) -> &Correspondence {
        &self.run.correspondence
    }

    /// Live events re-recorded so far.
    pub fn live_events(&self) -> &[Event] {
        self.run.record.events()
    }

    pub fn last_run(&self) -> Option<&ReplayRun> {
        self.last_run.as_ref()
    }

    /// Running, or stopped but still inside the finish grace period.
    pub fn is_active(&self) -> bool {
        self.run.state != ReplayState::Stopped || self.run.finish_at.is_some()
    }

    /// Earliest moment the engine has work to do.
    pub fn next_wake(&self) -> Option<SystemTime> {
        match (self.run.timer.deadline(), self.run.finish_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Start replaying `events` from the beginning.
    pub fn replay(
        &mut self,
        rt: &ReplayRuntime,
        events: Vec<Event>,
        config: ReplayConfig,
        continuation: Option<Continuation>,
    ) {
        self.run.timer.cancel();
        let mut record = std::mem::take(&mut self.run.record);
        record.reset();
        record.set_script_id(config.script_id);
        record.set_state(RecordState::Replaying);

        let now = rt.clock.now();
        append_run_log(
            "info",
            "replay.started",
            json!({
                "script_id": config.script_id,
                "events": events.len(),
                "seeded_ports": config.frame_mapping.len(),
                "seeded_tabs": config.tab_mapping.len(),
            }),
        );
        self.run = RunState {
            state: ReplayState::Replaying,
            script_id: config.script_id,
            events,
            correspondence: Correspondence::seeded(&config.frame_mapping, &config.tab_mapping),
            record,
            started_at: Some(now),
            continuation,
            ..RunState::default()
        };
        self.broadcast(rt, CoreMessage::Recording(RecordState::Replaying));
        self.schedule(now, 0);
    }

    /// Cancel the pending wake-up and tell pages to hold still.
    pub fn pause(&mut self, rt: &ReplayRuntime) {
        if self.run.timer.cancel() {
            append_run_log("debug", "replay.paused", json!({"index": self.run.index}));
        }
        self.broadcast(rt, CoreMessage::PauseReplay);
    }

    /// Resume after a pause. Does nothing if a wake-up is already pending.
    pub fn restart(&mut self, rt: &ReplayRuntime) {
        if self.run.state == ReplayState::Stopped || self.run.timer.is_armed() {
            return;
        }
        if self.run.state == ReplayState::Ack {
            self.run.state = ReplayState::Replaying;
        }
        self.schedule(rt.clock.now(), 0);
    }

    /// Give up on the current event and move to the next one.
    pub fn skip(&mut self) {
        if self.run.state == ReplayState::Stopped {
            return;
        }
        append_run_log("info", "replay.skipped", json!({"index": self.run.index}));
        self.run.index += 1;
        self.run.in_flight = None;
        self.run.ack = None;
        self.run.state = ReplayState::Replaying;
    }

    /// Stop waiting for an acknowledgment and send the current event again.
    pub fn resend(&mut self) {
        if self.run.state == ReplayState::Ack {
            append_run_log("info", "replay.resend", json!({"index": self.run.index}));
            self.run.in_flight = None;
            self.run.state = ReplayState::Replaying;
        }
    }

    /// Stop the replay. A second call, or a call on an idle engine, does
    /// nothing. The result is saved and handed to the continuation once the
    /// grace period has passed so late network events still land.
    pub fn finish(&mut self, rt: &ReplayRuntime, error: Option<String>) {
        if self.run.state == ReplayState::Stopped {
            return;
        }
        self.pause(rt);
        let now = rt.clock.now();
        self.run.state = ReplayState::Stopped;
        self.run.elapsed_ms = self
            .run
            .started_at
            .and_then(|start| now.duration_since(start).ok())
            .map_or(0, |d| d.as_millis() as u64);
        self.run.error = error;
        self.run.record.set_state(RecordState::Stopped);
        self.broadcast(rt, CoreMessage::Recording(RecordState::Stopped));
        append_run_log(
            if self.run.error.is_some() { "warn" } else { "info" },
            "replay.finish",
            json!({
                "index": self.run.index,
                "events": self.run.events.len(),
                "elapsed_ms": self.run.elapsed_ms,
                "error": self.run.error,
            }),
        );

        if self.params.finish_grace_ms == 0 {
            self.complete(rt);
        } else {
            self.run.finish_at = Some(now + Duration::from_millis(self.params.finish_grace_ms));
        }
    }

    fn complete(&mut self, rt: &ReplayRuntime) {
        self.run.finish_at = None;
        let run = ReplayRun {
            script_id: self.run.script_id,
            events: self.run.record.snapshot(),
            captures: self.run.captures.clone(),
            elapsed_ms: self.run.elapsed_ms,
            error: self.run.error.clone(),
            index: self.run.index,
            element_timeouts: self.run.element_timeouts,
            trigger_timeouts: self.run.trigger_timeouts,
        };

        if let Some(script_id) = run.script_id {
            if self.params.save_replay && !run.events.is_empty() {
                let saved = rt.scripts.save_script(SaveScriptRequest {
                    name: format!("replay {script_id}"),
                    events: run.events.clone(),
                    source_id: Some(script_id),
                    tag: "replay".to_string(),
                    captures: run.captures.clone(),
                    notes: run.error.clone().unwrap_or_default(),
                    params: serde_json::to_value(&self.params).ok(),
                });
                if let Err(err) = saved {
                    append_run_log(
                        "warn",
                        "replay.save_failed",
                        json!({"script_id": script_id, "error": err.to_string()}),
                    );
                }
            }
        }

        self.last_run = Some(run.clone());
        if let Some(continuation) = self.run.continuation.take() {
            continuation(&run);
        }
    }

    /// Run whatever is due now: the finish grace deadline or the next step.
    pub fn step(&mut self, rt: &ReplayRuntime, ports: &mut PortTable) {
        let now = rt.clock.now();
        if self.run.finish_at.is_some_and(|at| at <= now) {
            self.complete(rt);
            return;
        }
        if self.run.timer.take_due(now) {
            if let Err(err) = self.guts(rt, ports, now) {
                append_run_log(
                    "error",
                    "replay.fatal",
                    json!({"index": self.run.index, "error": err.to_string()}),
                );
                self.finish(rt, Some(err.to_string()));
            }
        }
    }

    /// Whether an inbound message is addressed to the running replay.
    pub fn accepts(&self, inbound: &Inbound) -> bool {
        if !self.is_active() {
            return false;
        }
        inbound.state == Some(RecordState::Replaying)
            || matches!(
                (&inbound.message, &inbound.port),
                (PageMessage::Event(_), None)
                    | (PageMessage::Ack(_), _)
                    | (PageMessage::SaveCapture(_), _)
            )
    }

    pub fn handle_inbound(&mut self, rt: &ReplayRuntime, ports: &PortTable, inbound: Inbound) {
        let port = inbound.port;
        match inbound.message {
            PageMessage::Event(event) => {
                let origin = port.as_deref().and_then(|p| ports.origin_of(p));
                self.run.record.append(event, origin.as_ref(), None);
            }
            PageMessage::UpdateEvent(update) => {
                let Some(port) = port else {
                    return;
                };
                if let Err(err) =
                    self.run
                        .record
                        .update_event(&port, update.page_event_id, &update.updates)
                {
                    append_run_log(
                        "warn",
                        "replay.update_event.unmatched",
                        json!({"port": port, "error": err.to_string()}),
                    );
                }
            }
            PageMessage::Ack(ack) => self.receive_ack(rt, ack),
            PageMessage::SaveCapture(capture) => {
                self.run.captures.push(capture);
                if self.run.state == ReplayState::Ack
                    && self.run.in_flight.is_some_and(|f| f.capture)
                {
                    self.receive_ack(
                        rt,
                        Ack {
                            ack_type: AckType::Success,
                            set_timeout: true,
                            executed: Some(1),
                        },
                    );
                }
            }
            PageMessage::Prompt(question) => {
                let Some(port) = port else {
                    return;
                };
                let answer = match rt.operator.ask(&question) {
                    Ok(answer) => answer,
                    Err(err) => {
                        append_run_log(
                            "warn",
                            "replay.prompt.unanswered",
                            json!({"error": err.to_string()}),
                        );
                        return;
                    }
                };
                if let Err(err) = rt.host.post(&port, CoreMessage::PromptResponse(answer)) {
                    append_run_log(
                        "warn",
                        "replay.prompt.undelivered",
                        json!({"port": port, "error": err.to_string()}),
                    );
                }
            }
            other => append_run_log(
                "debug",
                "replay.inbound.ignored",
                json!({"type": other.kind(), "port": port}),
            ),
        }
    }

    fn receive_ack(&mut self, rt: &ReplayRuntime, ack: Ack) {
        if self.run.state != ReplayState::Ack {
            append_run_log(
                "debug",
                "replay.ack.unexpected",
                json!({"state": self.run.state.as_str()}),
            );
            return;
        }
        self.run.ack = Some(ack);
        if ack.set_timeout {
            self.schedule(rt.clock.now(), 0);
        }
    }

    /// Poll pages and step until the replay has completed or `deadline`
    /// passes. Messages not meant for the replay go to `on_other`.
    pub fn drive_with(
        &mut self,
        rt: &ReplayRuntime,
        ports: &mut PortTable,
        deadline: Option<SystemTime>,
        on_other: &mut dyn FnMut(&PortTable, Inbound),
    ) -> Result<Option<ReplayRun>, ReplayError> {
        loop {
            for inbound in rt.host.poll_inbound()? {
                let Some(inbound) = ports.apply(inbound, rt.host.as_ref())? else {
                    continue;
                };
                if self.accepts(&inbound) {
                    self.handle_inbound(rt, ports, inbound);
                } else {
                    on_other(ports, inbound);
                }
            }

            self.step(rt, ports);
            if !self.is_active() {
                return Ok(self.last_run.clone());
            }

            let now = rt.clock.now();
            if deadline.is_some_and(|d| d <= now) {
                return Ok(None);
            }
            let mut wake = now + Duration::from_millis(POLL_INTERVAL_MS);
            if let Some(next) = self.next_wake() {
                wake = wake.min(next.max(now));
            }
            if let Some(d) = deadline {
                wake = wake.min(d);
            }
            rt.clock.sleep_until(wake)?;
        }
    }

    pub fn drive(
        &mut self,
        rt: &ReplayRuntime,
        ports: &mut PortTable,
        deadline: Option<SystemTime>,
    ) -> Result<Option<ReplayRun>, ReplayError> {
        self.drive_with(rt, ports, deadline, &mut |_, inbound| {
            append_run_log(
                "debug",
                "replay.inbound.unrouted",
                json!({"type": inbound.message.kind(), "port": inbound.port}),
            );
        })
    }

    /// Replay `events` to completion inside the current replay, then put the
    /// outer replay back exactly as it was, even if the nested one failed.
    pub fn sub_replay(
        &mut self,
        rt: &ReplayRuntime,
        ports: &mut PortTable,
        events: Vec<Event>,
        config: ReplayConfig,
        timeout: Option<Duration>,
        check: impl FnOnce(&ReplayRun),
    ) -> Result<ReplayRun, ReplayError> {
        let saved = std::mem::take(&mut self.run);
        let saved_last = self.last_run.take();
        append_run_log("info", "replay.sub_replay.started", json!({"events": events.len()}));

        let nested = self.run_nested(rt, ports, events, config, timeout);
        if let Ok(run) = &nested {
            check(run);
        }

        self.run = saved;
        self.last_run = saved_last;
        self.run.state = ReplayState::Replaying;
        self.run.record.set_state(RecordState::Replaying);
        self.broadcast(rt, CoreMessage::Recording(RecordState::Replaying));
        append_run_log(
            "info",
            "replay.sub_replay.restored",
            json!({"index": self.run.index, "ok": nested.is_ok()}),
        );
        nested
    }

    fn run_nested(
        &mut self,
        rt: &ReplayRuntime,
        ports: &mut PortTable,
        events: Vec<Event>,
        config: ReplayConfig,
        timeout: Option<Duration>,
    ) -> Result<ReplayRun, ReplayError> {
        self.replay(rt, events, config, None);
        let deadline = timeout.map(|t| rt.clock.now() + t);
        if let Some(run) = self.drive(rt, ports, deadline)? {
            return Ok(run);
        }
        self.finish(rt, Some("sub-replay timed out".to_string()));
        self.drive(rt, ports, None)?
            .ok_or_else(|| ReplayError::InvalidState("sub-replay did not complete".to_string()))
    }

    fn schedule(&mut self, now: SystemTime, delay_ms: u64) {
        self.run
            .timer
            .arm(now, delay_ms + self.params.dispatch_padding_ms);
    }

    fn broadcast(&self, rt: &ReplayRuntime, message: CoreMessage) {
        let kind = message.kind();
        if let Err(err) = rt.host.broadcast(message) {
            append_run_log(
                "warn",
                "replay.broadcast_failed",
                json!({"type": kind, "error": err.to_string()}),
            );
        }
    }

    /// Milliseconds the current index has been current, restarting the
    /// measurement whenever the index moves.
    fn time_at_index(&mut self, now: SystemTime) -> u64 {
        match self.run.index_clock {
            Some((index, since)) if index == self.run.index => now
                .duration_since(since)
                .map_or(0, |d| d.as_millis() as u64),
            _ => {
                self.run.index_clock = Some((self.run.index, now));
                0
            }
        }
    }

    fn guts(
        &mut self,
        rt: &ReplayRuntime,
        ports: &mut PortTable,
        now: SystemTime,
    ) -> Result<(), ReplayError> {
        if self.run.state == ReplayState::Stopped {
            return Err(ReplayError::InvalidState(
                "scheduled step ran while stopped".to_string(),
            ));
        }

        let at_index_ms = self.time_at_index(now);
        let event_timeout_ms = self.params.event_timeout_secs * 1000;
        if event_timeout_ms > 0 && at_index_ms > event_timeout_ms {
            self.event_timed_out(rt);
            return self.schedule_next(now);
        }

        if self.run.state == ReplayState::Ack {
            return self.check_ack(now);
        }

        let Some(event) = self.run.events.get(self.run.index).cloned() else {
            self.finish(rt, None);
            return Ok(());
        };

        match event.kind {
            EventKind::Dom | EventKind::Capture => self.dispatch(rt, ports, now, &event, at_index_ms),
            EventKind::Completed | EventKind::Error => {
                self.run.index += 1;
                self.schedule(now, 0);
                Ok(())
            }
        }
    }

    fn event_timed_out(&mut self, rt: &ReplayRuntime) {
        let event_id = self
            .run
            .events
            .get(self.run.index)
            .map(|e| e.meta.id.clone())
            .unwrap_or_default();
        append_run_log(
            "warn",
            "replay.event_timeout",
            json!({"index": self.run.index, "event": event_id}),
        );
        if let Some(tab) = self.run.correspondence.last_tab {
            if let Err(err) = rt.host.capture_screenshot(tab, &format!("timeout-{event_id}")) {
                append_run_log(
                    "warn",
                    "replay.screenshot_failed",
                    json!({"tab": tab, "error": err.to_string()}),
                );
            }
        }
        self.run.element_timeouts += 1;
        self.run.index += 1;
        self.run.in_flight = None;
        self.run.ack = None;
        self.run.state = ReplayState::Replaying;
    }

    fn check_ack(&mut self, now: SystemTime) -> Result<(), ReplayError> {
        let Some(ack) = self.run.ack.take() else {
            append_run_log(
                "debug",
                "replay.ack.waiting",
                json!({"index": self.run.index}),
            );
            self.schedule(now, self.params.default_wait_ms);
            return Ok(());
        };

        let in_flight = self.run.in_flight.take().unwrap_or(InFlight {
            start: self.run.index,
            len: 1,
            capture: false,
        });
        match ack.ack_type {
            AckType::Success => {
                self.run.index = in_flight.start + in_flight.len;
            }
            AckType::Partial => {
                let executed = ack.executed.unwrap_or(0).min(in_flight.len);
                match PartialAckStrategy::parse(&self.params.partial_ack_strategy)? {
                    PartialAckStrategy::Abort => {
                        return Err(ReplayError::ProtocolViolation(format!(
                            "page executed {executed} of {} dispatched events at index {}",
                            in_flight.len, in_flight.start
                        )));
                    }
                    PartialAckStrategy::ResendRemainder => {
                        append_run_log(
                            "warn",
                            "replay.ack.partial",
                            json!({"index": in_flight.start, "executed": executed, "group": in_flight.len}),
                        );
                        self.run.index = in_flight.start + executed;
                    }
                }
            }
        }
        self.run.state = ReplayState::Replaying;
        self.schedule_next(now)
    }

    /// Arm the wake-up for the event at the current index, paced by the
    /// timing strategy.
    fn schedule_next(&mut self, now: SystemTime) -> Result<(), ReplayError> {
        let strategy = TimingStrategy::parse(&self.params.timing_strategy)?;
        let delay = next_delay(
            &self.run.events,
            self.run.index,
            strategy,
            &self.params,
            &self.overrides,
            &mut self.rng,
        );
        self.schedule(now, delay);
        Ok(())
    }

    /// Whether `event` was already re-produced live, e.g. as a side effect of
    /// an earlier dispatched event.
    fn already_replayed(&self, event: &Event) -> bool {
        self.run
            .record
            .events()
            .iter()
            .rev()
            .any(|live| live.meta.record_id.as_deref() == Some(event.meta.id.as_str()))
    }

    fn dispatch(
        &mut self,
        rt: &ReplayRuntime,
        ports: &mut PortTable,
        now: SystemTime,
        event: &Event,
        at_index_ms: u64,
    ) -> Result<(), ReplayError> {
        if self.params.cascade_check && self.already_replayed(event) {
            append_run_log(
                "debug",
                "replay.cascade_skip",
                json!({"event": event.meta.id}),
            );
            self.run.index += 1;
            return self.schedule_next(now);
        }

        ports.prune_removed(&rt.host.open_tabs()?);
        let mut cx = ResolveContext {
            ports,
            host: rt.host.as_ref(),
            operator: rt.operator.as_ref(),
            params: &self.params,
            first_event_replayed: self.run.first_event_replayed,
        };
        let port = match self.run.correspondence.resolve(event, &mut cx)? {
            Resolution::Port(port) => port,
            Resolution::Wait(delay) => {
                self.schedule(now, delay);
                return Ok(());
            }
        };

        if let Some(conditions) = &event.timing.trigger_condition {
            if !conditions_met(self.run.record.events(), &self.run.events, conditions) {
                let trigger_timeout_ms = self.params.trigger_timeout_secs * 1000;
                if trigger_timeout_ms > 0 && at_index_ms > trigger_timeout_ms {
                    append_run_log(
                        "warn",
                        "replay.trigger_timeout",
                        json!({"event": event.meta.id}),
                    );
                    self.run.trigger_timeouts += 1;
                } else {
                    self.schedule(now, self.params.default_wait_ms);
                    return Ok(());
                }
            }
        }

        let (message, len, capture) = match event.kind {
            EventKind::Capture => (CoreMessage::SimulateCapture(event.clone()), 1, true),
            _ => {
                let group = self.atomic_group(event);
                let len = group.len();
                (CoreMessage::Dom(group), len, false)
            }
        };

        self.run.ack = None;
        match rt.host.post(&port, message) {
            Ok(()) => {
                append_run_log(
                    "info",
                    "replay.dispatch",
                    json!({"index": self.run.index, "event": event.meta.id, "port": port, "group": len}),
                );
                self.run.in_flight = Some(InFlight {
                    start: self.run.index,
                    len,
                    capture,
                });
                self.run.state = ReplayState::Ack;
                self.run.first_event_replayed = true;
                self.schedule(now, 0);
                Ok(())
            }
            Err(ReplayError::ChannelClosed(closed)) => {
                self.broken_channel(event, &closed)?;
                self.schedule(now, 0);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The event plus the contiguous sub-events on the same port that end
    /// at its end-event marker, when atomic grouping is on.
    fn atomic_group(&self, first: &Event) -> Vec<Event> {
        let mut group = vec![first.clone()];
        if !self.params.atomic || first.kind != EventKind::Dom {
            return group;
        }
        let (Some(page_event), Some(end)) = (first.meta.page_event_id, first.meta.end_event_id)
        else {
            return group;
        };
        if page_event >= end {
            return group;
        }
        for next in self.run.events.iter().skip(self.run.index + 1) {
            let within = next.meta.page_event_id.is_some_and(|id| id <= end);
            if !within || next.kind != EventKind::Dom || next.frame.port != first.frame.port {
                break;
            }
            group.push(next.clone());
        }
        group
    }

    fn broken_channel(&mut self, event: &Event, closed: &str) -> Result<(), ReplayError> {
        match BrokenChannelStrategy::parse(&self.params.broken_channel_strategy)? {
            BrokenChannelStrategy::Retry => {
                if event.data.cascading {
                    append_run_log(
                        "info",
                        "replay.broken_channel.skip_cascade",
                        json!({"event": event.meta.id, "port": closed}),
                    );
                    self.run.index += 1;
                } else {
                    let recorded = event.frame.port.clone().unwrap_or_default();
                    self.run.correspondence.forget_port(&recorded);
                    append_run_log(
                        "info",
                        "replay.broken_channel.rematch",
                        json!({"event": event.meta.id, "port": closed}),
                    );
                }
                Ok(())
            }
        }
    }
}
