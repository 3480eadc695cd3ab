use crate::errors::ReplayError;
use crate::event::Event;
use crate::logging::append_run_log;
use crate::ports::FrameOrigin;
use crate::types::RecordState;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// One `{field, value}` pair from an `updateEvent` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreNotice {
    Reset,
    Status(RecordState),
    Appended { id: String, index: usize },
    Updated { id: String, field: String },
}

/// Result of applying a batch of page updates to one event.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub event_id: String,
    pub applied: usize,
    pub failures: Vec<ReplayError>,
}

/// Ordered events of a recording, or of a replay being re-recorded.
#[derive(Debug)]
pub struct EventStore {
    events: Vec<Event>,
    next_id: u64,
    last_time: Option<i64>,
    state: RecordState,
    script_id: Option<i64>,
    listeners: Vec<UnboundedSender<StoreNotice>>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            last_time: None,
            state: RecordState::Stopped,
            script_id: None,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<StoreNotice> {
        let (tx, rx) = unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn notify(&mut self, notice: StoreNotice) {
        self.listeners.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn set_state(&mut self, state: RecordState) {
        self.state = state;
        self.notify(StoreNotice::Status(state));
    }

    pub fn script_id(&self) -> Option<i64> {
        self.script_id
    }

    pub fn set_script_id(&mut self, script_id: Option<i64>) {
        self.script_id = script_id;
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Add an event, stamping frame identity, wait time and a fresh id.
    ///
    /// Ids are `event<N>` with `N` drawn from a counter that only moves
    /// forward, so an id is never handed out twice even after inserts.
    pub fn append(
        &mut self,
        mut event: Event,
        origin: Option<&FrameOrigin>,
        insert_at: Option<usize>,
    ) -> String {
        if let Some(origin) = origin {
            event.frame.port = Some(origin.port.clone());
            event.frame.tab = Some(origin.tab);
            event.frame.top_url = origin.top_url.clone();
            event.frame.top_frame = origin.top_frame;
            event.frame.iframe_index = origin.iframe_index;
        }

        let time = event.data.timestamp;
        event.timing.wait_time = self.last_time.map_or(0, |last| time - last);
        self.last_time = Some(time);

        let id = format!("event{}", self.next_id);
        self.next_id += 1;
        event.meta.id = id.clone();

        let index = match insert_at {
            Some(index) if index <= self.events.len() => {
                self.events.insert(index, event);
                index
            }
            _ => {
                self.events.push(event);
                self.events.len() - 1
            }
        };

        append_run_log(
            "debug",
            "record.event.appended",
            json!({"id": id, "index": index}),
        );
        self.notify(StoreNotice::Appended {
            id: id.clone(),
            index,
        });
        id
    }

    /// Set `path` on the newest event with `event_id`.
    pub fn update_field(
        &mut self,
        event_id: &str,
        path: &str,
        value: Value,
    ) -> Result<(), ReplayError> {
        let event = self
            .events
            .iter_mut()
            .rev()
            .find(|e| e.meta.id == event_id)
            .ok_or_else(|| ReplayError::EventNotFound(event_id.to_string()))?;
        event.set_field(path, value)?;
        self.notify(StoreNotice::Updated {
            id: event_id.to_string(),
            field: path.to_string(),
        });
        Ok(())
    }

    /// Apply page-side updates to the newest event raised by `port` with the
    /// given page event id. A bad field fails only its own update.
    pub fn update_event(
        &mut self,
        port: &str,
        page_event_id: u64,
        updates: &[FieldUpdate],
    ) -> Result<UpdateOutcome, ReplayError> {
        let event_id = self
            .events
            .iter()
            .rev()
            .find(|e| {
                e.frame.port.as_deref() == Some(port)
                    && e.meta.page_event_id == Some(page_event_id)
            })
            .map(|e| e.meta.id.clone())
            .ok_or_else(|| {
                ReplayError::EventNotFound(format!("port {port} page event {page_event_id}"))
            })?;

        let mut outcome = UpdateOutcome {
            event_id: event_id.clone(),
            ..UpdateOutcome::default()
        };
        for update in updates {
            match self.update_field(&event_id, &update.field, update.value.clone()) {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    append_run_log(
                        "warn",
                        "record.event.update_failed",
                        json!({"id": event_id, "field": update.field, "error": err.to_string()}),
                    );
                    outcome.failures.push(err);
                }
            }
        }
        Ok(outcome)
    }

    /// Deep copy of the events; later mutation of the store does not leak in.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.clone()
    }

    /// Replace the contents with previously stored events. The id counter
    /// moves past every id already present.
    pub fn set_events(&mut self, events: Vec<Event>) {
        self.reset();
        let highest = events
            .iter()
            .filter_map(|e| e.meta.id.strip_prefix("event"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max();
        self.next_id = highest.map_or(events.len() as u64, |n| (n + 1).max(events.len() as u64));
        self.last_time = events.last().map(|e| e.data.timestamp);
        self.events = events;
    }

    pub fn reset(&mut self) {
        self.state = RecordState::Stopped;
        self.script_id = None;
        self.events.clear();
        self.next_id = 0;
        self.last_time = None;
        self.notify(StoreNotice::Reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn dom(ts: i64) -> Event {
        Event::new(EventKind::Dom, ts)
    }

    #[test]
    fn ids_strictly_increase_even_with_point_inserts() {
        let mut store = EventStore::new();
        let a = store.append(dom(10), None, None);
        let b = store.append(dom(20), None, Some(0));
        let c = store.append(dom(30), None, Some(1));
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("event0", "event1", "event2"));

        let order = store
            .events()
            .iter()
            .map(|e| e.meta.id.clone())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["event1", "event2", "event0"]);
    }

    #[test]
    fn first_wait_is_zero_and_later_waits_are_deltas() {
        let mut store = EventStore::new();
        store.append(dom(1_000), None, None);
        store.append(dom(1_250), None, None);
        store.append(dom(1_900), None, None);
        let waits = store
            .events()
            .iter()
            .map(|e| e.timing.wait_time)
            .collect::<Vec<_>>();
        assert_eq!(waits, vec![0, 250, 650]);
    }

    #[test]
    fn origin_is_stamped_onto_frame() {
        let mut store = EventStore::new();
        let origin = FrameOrigin {
            port: "7".to_string(),
            tab: 3,
            top_url: Some("http://a.test/".to_string()),
            top_frame: false,
            iframe_index: 2,
        };
        store.append(dom(5), Some(&origin), None);
        let frame = &store.events()[0].frame;
        assert_eq!(frame.port.as_deref(), Some("7"));
        assert_eq!(frame.tab, Some(3));
        assert_eq!(frame.iframe_index, 2);
        assert!(!frame.top_frame);
    }

    #[test]
    fn update_event_applies_good_fields_and_reports_bad_ones() {
        let mut store = EventStore::new();
        let origin = FrameOrigin {
            port: "1".to_string(),
            tab: 1,
            top_url: None,
            top_frame: true,
            iframe_index: -1,
        };
        let mut event = dom(5);
        event.meta.page_event_id = Some(42);
        store.append(event, Some(&origin), None);

        let outcome = store
            .update_event(
                "1",
                42,
                &[
                    FieldUpdate {
                        field: "data.value".to_string(),
                        value: json!("typed text"),
                    },
                    FieldUpdate {
                        field: "meta.nope".to_string(),
                        value: json!(1),
                    },
                ],
            )
            .expect("event exists");
        assert_eq!(outcome.applied, 1);
        assert!(matches!(outcome.failures[0], ReplayError::FieldNotFound { .. }));
        assert_eq!(
            store.events()[0].data.extra.get("value"),
            Some(&json!("typed text"))
        );

        let missing = store.update_event("2", 42, &[]).expect_err("other port");
        assert!(matches!(missing, ReplayError::EventNotFound(_)));
    }

    #[test]
    fn snapshot_is_independent_and_reset_notifies() {
        let mut store = EventStore::new();
        let mut notices = store.subscribe();
        store.append(dom(1), None, None);
        let mut copy = store.snapshot();
        copy[0].timing.wait_time = 99;
        assert_eq!(store.events()[0].timing.wait_time, 0);

        store.reset();
        assert!(store.is_empty());
        assert!(matches!(notices.try_recv(), Ok(StoreNotice::Appended { .. })));
        assert_eq!(notices.try_recv().ok(), Some(StoreNotice::Reset));
    }

    #[test]
    fn set_events_keeps_ids_unique_for_later_appends() {
        let mut store = EventStore::new();
        let mut loaded = dom(1);
        loaded.meta.id = "event9".to_string();
        store.set_events(vec![loaded]);
        assert_eq!(store.append(dom(2), None, None), "event10");
    }
}
