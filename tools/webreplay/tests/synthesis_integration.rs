use serde_json::json;
use std::sync::{Arc, Mutex};
use webreplay::config::AppConfig;
use webreplay::errors::ReplayError;
use webreplay::event::{Event, EventKind};
use webreplay::protocol::{CoreMessage, Inbound};
use webreplay::runtime::{
    BrowserHost, FakeBrowserHost, FakeClock, FakeFileSystem, FakeOperator, FakeTerminal,
    KeyValueStore, MemoryKeyValueStore, MemoryScriptStore, ReplayRuntime, ScriptStore, TabInfo,
};
use webreplay::script_store::SaveScriptRequest;
use webreplay::synthesis::{SynthesisSession, TriggerCandidate, WaitDelta};
use webreplay::types::TabId;

const SHOP: &str = "http://shop.test/";
const CART_API: &str = "http://shop.test/api/cart";

fn recorded(id: &str, kind: EventKind, wait: i64) -> Event {
    let mut event = Event::new(kind, 0);
    event.meta.id = id.to_string();
    event.timing.wait_time = wait;
    if kind.is_replayable() {
        event.frame.port = Some("p1".to_string());
        event.frame.tab = Some(1);
        event.frame.top_url = Some(SHOP.to_string());
        event.frame.url = Some(SHOP.to_string());
    }
    event
}

/// Click "add to cart", the cart request completes, open the cart, then
/// scrape the cart badge.
fn cart_script() -> Vec<Event> {
    let mut completed = recorded("event1", EventKind::Completed, 300);
    completed.data.url = Some(CART_API.to_string());
    let mut capture = recorded("event3", EventKind::Capture, 100);
    capture.data.target = Some(json!({"snapshot": {"prop": {"innerText": "Cart: 1"}}}));
    vec![
        recorded("event0", EventKind::Dom, 0),
        completed,
        recorded("event2", EventKind::Dom, 200),
        capture,
    ]
}

struct Fixture {
    rt: ReplayRuntime,
    host: FakeBrowserHost,
    scripts: MemoryScriptStore,
    kv: MemoryKeyValueStore,
}

fn fixture_with_host(host: Arc<dyn BrowserHost>, fake: FakeBrowserHost) -> Fixture {
    let scripts = MemoryScriptStore::default();
    let kv = MemoryKeyValueStore::default();
    scripts
        .save_script(SaveScriptRequest {
            name: "cart".to_string(),
            events: cart_script(),
            tag: "recording".to_string(),
            ..SaveScriptRequest::default()
        })
        .expect("seed script");
    fake.complete_requests_after("event0", &[CART_API]);
    let rt = ReplayRuntime {
        clock: Arc::new(FakeClock::default()),
        file_system: Arc::new(FakeFileSystem::default()),
        terminal: Arc::new(FakeTerminal::default()),
        host,
        operator: Arc::new(FakeOperator::default()),
        scripts: Arc::new(scripts.clone()),
        kv: Arc::new(kv.clone()),
    };
    Fixture {
        rt,
        host: fake,
        scripts,
        kv,
    }
}

fn fixture() -> Fixture {
    let host = FakeBrowserHost::new();
    fixture_with_host(Arc::new(host.clone()), host)
}

/// Page whose cart badge stops updating once `healthy_tabs` tabs have been
/// opened, standing in for a site that breaks when replayed too fast.
struct DegradingHost {
    inner: FakeBrowserHost,
    healthy_tabs: usize,
    opened: Mutex<usize>,
}

impl BrowserHost for DegradingHost {
    fn post(&self, port: &str, message: CoreMessage) -> Result<(), ReplayError> {
        self.inner.post(port, message)
    }
    fn broadcast(&self, message: CoreMessage) -> Result<(), ReplayError> {
        self.inner.broadcast(message)
    }
    fn poll_inbound(&self) -> Result<Vec<Inbound>, ReplayError> {
        self.inner.poll_inbound()
    }
    fn open_tabs(&self) -> Result<Vec<TabId>, ReplayError> {
        self.inner.open_tabs()
    }
    fn create_tab(&self, url: &str) -> Result<TabId, ReplayError> {
        let mut opened = self.opened.lock().expect("opened lock");
        *opened += 1;
        if *opened > self.healthy_tabs {
            self.inner.set_capture_text("event3", "Cart: 0");
        }
        self.inner.create_tab(url)
    }
    fn get_tab(&self, tab: TabId) -> Result<Option<TabInfo>, ReplayError> {
        self.inner.get_tab(tab)
    }
    fn remove_tab(&self, tab: TabId) -> Result<(), ReplayError> {
        self.inner.remove_tab(tab)
    }
    fn foreground_tab(&self) -> Result<Option<TabId>, ReplayError> {
        self.inner.foreground_tab()
    }
    fn capture_screenshot(&self, tab: TabId, label: &str) -> Result<(), ReplayError> {
        self.inner.capture_screenshot(tab, label)
    }
}

#[test]
fn learns_trigger_for_event_following_a_stable_request() {
    let fx = fixture();
    let mut session = SynthesisSession::new(fx.rt.clone(), AppConfig::default());
    let report = session.run("cart").expect("synthesis");

    assert_eq!(report.baseline_runs, 2);
    assert_eq!(
        report.trigger_map.get("event2"),
        Some(
            &[
                TriggerCandidate::Event {
                    event_id: "event1".to_string()
                },
                TriggerCandidate::NoSyncNeeded
            ][..]
        )
    );
    assert!(report.accepted.contains(&WaitDelta::AddTrigger {
        target: "event2".to_string(),
        trigger: "event1".to_string(),
    }));

    let event2 = &report.events[2];
    assert_eq!(event2.timing.wait_event.as_deref(), Some("event1"));
    assert_eq!(event2.timing.wait_time, 0);
    let condition = event2.timing.trigger_condition.clone().expect("condition");
    assert_eq!(condition[0].start.as_deref(), Some("event0"));

    let ran = report.trials.iter().filter(|t| t.ran).collect::<Vec<_>>();
    assert_eq!(ran.len(), 1);
    assert!(ran[0].passed);

    // Two baselines plus two runs for the one real trial.
    assert_eq!(session.summaries().len(), 4);
    assert!(session.summaries().iter().all(|s| s.passed));
    assert_eq!(fx.host.created_tabs().len(), 4);
    assert_eq!(fx.host.removed_tabs(), vec![100, 101, 102, 103]);
}

#[test]
fn saves_every_variant_with_labels() {
    let fx = fixture();
    let mut session = SynthesisSession::new(fx.rt.clone(), AppConfig::default());
    let report = session.run("cart").expect("synthesis");

    let tags = fx.scripts.tags();
    assert_eq!(
        tags,
        vec![
            "recording",
            "original",
            "replay,find_trigger,true",
            "replay,find_trigger,true",
            "original,add_trigger_event2_event1",
            "replay,add_trigger_event2_event1,true",
            "replay,add_trigger_event2_event1,true",
            "final",
        ]
    );
    let variants = fx.scripts.variants();
    let suite = &variants[1];
    assert!(suite.name.starts_with("cart synth "));
    assert_eq!(suite.id, report.suite_id);
    let last = variants.last().expect("final variant");
    assert_eq!(last.id, report.final_script_id);
    assert_eq!(last.source_id, Some(report.suite_id));
    assert_eq!(last.notes, "add_trigger_event2_event1");
}

#[test]
fn persists_inspection_log() {
    let fx = fixture();
    let mut session = SynthesisSession::new(fx.rt.clone(), AppConfig::default());
    session.run("cart").expect("synthesis");

    let replays = fx.kv.get("learningReplays").expect("kv").expect("replays");
    let replays = replays.as_array().expect("array");
    assert_eq!(replays.len(), 4);
    assert_eq!(replays[0]["label"], "find_trigger");
    assert_eq!(replays[0]["verdict"]["verdict"], "pass");
    assert_eq!(replays[0]["captures"], 1);

    let triggers = fx.kv.get("learningTriggers").expect("kv").expect("triggers");
    assert_eq!(triggers["entries"].as_array().expect("entries").len(), 3);
}

#[test]
fn failing_trial_keeps_recorded_wait() {
    let inner = FakeBrowserHost::new();
    let host = Arc::new(DegradingHost {
        inner: inner.clone(),
        healthy_tabs: 2,
        opened: Mutex::new(0),
    });
    let fx = fixture_with_host(host, inner);
    let mut session = SynthesisSession::new(fx.rt.clone(), AppConfig::default());
    let report = session.run("cart").expect("synthesis");

    assert_eq!(report.events, cart_script());
    assert!(report
        .accepted
        .iter()
        .all(|delta| matches!(delta, WaitDelta::NoSyncNeeded { .. })));
    let ran = report.trials.iter().filter(|t| t.ran).collect::<Vec<_>>();
    assert_eq!(ran.len(), 1);
    assert!(!ran[0].passed);

    // Both runs of the failing trial are kept.
    assert_eq!(session.summaries().len(), 4);
    let failed = fx
        .scripts
        .tags()
        .into_iter()
        .filter(|tag| tag == "replay,add_trigger_event2_event1,false")
        .count();
    assert_eq!(failed, 2);
    let replays = fx.kv.get("learningReplays").expect("kv").expect("replays");
    assert_eq!(replays.as_array().expect("array").len(), 4);
}

#[test]
fn too_few_passing_baselines_abort_synthesis() {
    let fx = fixture();
    fx.host.set_capture_text("event3", "Cart: 0");
    let mut config = AppConfig::default();
    config.synthesis.max_baseline_attempts = 3;
    let mut session = SynthesisSession::new(fx.rt.clone(), config);

    let err = session.run("cart").expect_err("baselines fail");
    assert!(matches!(err, ReplayError::Synthesis(_)));
    assert_eq!(session.summaries().len(), 3);
    assert!(session.summaries().iter().all(|s| !s.passed));
}

#[test]
fn unknown_script_is_reported() {
    let fx = fixture();
    let mut session = SynthesisSession::new(fx.rt.clone(), AppConfig::default());
    assert!(session.run("missing").is_err());
    assert!(fx.host.created_tabs().is_empty());
}

#[test]
fn script_without_requests_comes_back_unchanged() {
    let fx = fixture();
    let clicks = (0..3)
        .map(|i| recorded(&format!("click{i}"), EventKind::Dom, 150))
        .collect::<Vec<_>>();
    fx.scripts
        .save_script(SaveScriptRequest {
            name: "clicks".to_string(),
            events: clicks.clone(),
            tag: "recording".to_string(),
            ..SaveScriptRequest::default()
        })
        .expect("seed script");
    let mut session = SynthesisSession::new(fx.rt.clone(), AppConfig::default());
    let report = session.run("clicks").expect("synthesis");

    assert_eq!(report.baseline_runs, 2);
    for id in ["click0", "click1", "click2"] {
        assert_eq!(
            report.trigger_map.get(id),
            Some(&[TriggerCandidate::NoSyncNeeded][..])
        );
    }
    assert_eq!(report.events, clicks);
    assert!(report.trials.iter().all(|t| !t.ran));
    assert_eq!(session.summaries().len(), 2);
}
