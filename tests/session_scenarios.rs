use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use attribution_core::{
    keys, pref_keys, AdvertisingId, AdvertisingIdCallback, Client, ClientConfig, DeviceSignals,
    Error, Event, InitOptions, InstallReferrer, InstallReferrerCallback, InstallReferrerProvider,
    KeyValueStore, LinkProperties, MemoryStore, Payload, RequestPath, ServerResponse,
    SessionState, Transport, WaitLock, NO_STRING_VALUE,
};
use serde_json::{json, Value};
use url::Url;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
struct Call {
    path: String,
    body: Payload,
}

/// Answers from a closure, optionally holding every call until the gate opens.
struct ScriptedServer {
    respond: Box<dyn Fn(&str, &Payload) -> ServerResponse + Send + Sync>,
    calls: Mutex<Vec<Call>>,
    gate: Mutex<bool>,
    gate_opened: Condvar,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedServer {
    fn new(respond: impl Fn(&str, &Payload) -> ServerResponse + Send + Sync + 'static) -> Self {
        ScriptedServer {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(true),
            gate_opened: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn sessions() -> Self {
        ScriptedServer::new(|path, payload| match path {
            "v1/install" | "v1/open" => ServerResponse::ok(json!({
                "session_id": "s1",
                "randomized_bundle_token": "b1",
                "data": "{\"+clicked_branch_link\":false}",
            })),
            "v1/url" => ServerResponse::ok(json!({
                "url": format!("https://app.link/{}", payload["alias"].as_str().unwrap_or("x")),
            })),
            _ => ServerResponse::ok(json!({})),
        })
    }

    fn closed(self) -> Self {
        *self.gate.lock().unwrap() = false;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.gate_opened.notify_all();
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|it| it.path).collect()
    }

    fn handle(&self, url: &Url, payload: &Payload) -> ServerResponse {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        {
            let mut open = self.gate.lock().unwrap();
            while !*open {
                open = self.gate_opened.wait(open).unwrap();
            }
        }
        std::thread::sleep(self.delay);
        let path = url.path().trim_start_matches('/').to_owned();
        let response = (self.respond)(&path, payload);
        self.calls.lock().unwrap().push(Call {
            path,
            body: payload.clone(),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

impl Transport for ScriptedServer {
    fn post(&self, url: &Url, payload: &Payload, _: &str, _: Duration) -> ServerResponse {
        self.handle(url, payload)
    }

    fn get(&self, url: &Url, params: &Payload, _: &str, _: Duration) -> ServerResponse {
        self.handle(url, params)
    }
}

/// Advertising ID fetches complete only when the test says so.
#[derive(Default)]
struct Device {
    pending: Mutex<Vec<AdvertisingIdCallback>>,
}

impl Device {
    fn complete(&self, id: Option<&str>) {
        for done in std::mem::take(&mut *self.pending.lock().unwrap()) {
            done(id.map(|id| AdvertisingId {
                id: id.to_owned(),
                limit_ad_tracking: false,
            }));
        }
    }
}

impl DeviceSignals for Device {
    fn fetch_advertising_id(&self, done: AdvertisingIdCallback) {
        self.pending.lock().unwrap().push(done);
    }

    fn user_agent(&self) -> Option<String> {
        None
    }

    fn device_info(&self) -> Payload {
        let mut info = Payload::new();
        info.insert("os".to_owned(), json!("TestOS"));
        info
    }
}

#[derive(Default)]
struct Referrer {
    pending: Mutex<Option<InstallReferrerCallback>>,
}

impl Referrer {
    fn complete(&self) {
        if let Some(done) = self.pending.lock().unwrap().take() {
            done(Some(InstallReferrer {
                store: "play".to_owned(),
                referrer: "utm_source=scenario".to_owned(),
                click_timestamp: 1,
                install_begin_timestamp: 2,
            }));
        }
    }
}

impl InstallReferrerProvider for Referrer {
    fn name(&self) -> &str {
        "play"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn fetch(&self, done: InstallReferrerCallback) {
        *self.pending.lock().unwrap() = Some(done);
    }
}

fn config(server: &Arc<ScriptedServer>, device: &Arc<Device>) -> ClientConfig {
    ClientConfig::from_app_key("key_test_scenario")
        .base_url("http://localhost/")
        .read_timeout(Duration::from_secs(2))
        .connect_timeout(Duration::from_secs(2))
        .retry_interval(Duration::from_millis(20), Duration::ZERO)
        .collaborator_max_wait(Duration::from_secs(5))
        .transport(server.clone())
        .device_signals(device.clone())
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn start_session(client: &Client, device: &Device) {
    let (tx, rx) = mpsc::channel();
    client.init_session(InitOptions::new().callback(move |it| {
        let _ = tx.send(it);
    }));
    device.complete(Some("gaid"));
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
}

#[test]
fn install_waits_for_collaborators_then_establishes_session() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());
    let referrer = Arc::new(Referrer::default());
    let client = config(&server, &device)
        .referrer_provider(referrer.clone())
        .to_client()
        .unwrap();

    client.init_session(InitOptions::new());

    let head = client.queued_requests()[0].clone();
    assert_eq!(head.path, RequestPath::RegisterInstall);
    assert_eq!(
        head.locks,
        vec![WaitLock::AdvertisingIdFetch, WaitLock::InstallReferrerFetch]
    );

    referrer.complete();
    device.complete(Some("gaid"));

    assert!(wait_until(|| client.session_state() == SessionState::Initialized));
    assert!(client.has_active_session());
    let install = server.calls()[0].clone();
    assert_eq!(install.path, "v1/install");
    assert_eq!(install.body[keys::INSTALL_REFERRER], json!("utm_source=scenario"));
}

#[test]
fn event_submitted_during_install_runs_right_after_it() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());
    let client = config(&server, &device).to_client().unwrap();

    client.init_session(InitOptions::new());
    let (tx, rx) = mpsc::channel();
    client.log_event(Event::custom("level_up"), move |it| {
        let _ = tx.send(it);
    });

    let queued = client.queued_requests();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[1].path, RequestPath::TrackCustomEvent);
    assert_eq!(queued[1].locks, vec![WaitLock::SdkInit]);
    std::thread::sleep(Duration::from_millis(50));
    assert!(server.calls().is_empty());

    device.complete(None);
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    assert_eq!(server.paths(), vec!["v1/install", "v2/event/custom"]);
    // Tokens were not known when the event was created.
    assert_eq!(server.calls()[1].body[keys::SESSION_ID], json!("s1"));
    assert_eq!(server.calls()[1].body[keys::RANDOMIZED_BUNDLE_TOKEN], json!("b1"));
}

#[test]
fn session_without_device_token_still_sends_queued_event() {
    init_logs();
    let server = Arc::new(ScriptedServer::new(|path, _| match path {
        "v1/install" => ServerResponse::ok(json!({"session_id": "s1", "randomized_bundle_token": "b1"})),
        _ => ServerResponse::ok(json!({})),
    }));
    let device = Arc::new(Device::default());
    let client = config(&server, &device).to_client().unwrap();

    client.init_session(InitOptions::new());
    let (tx, rx) = mpsc::channel();
    client.log_event(Event::custom("signup"), move |it| {
        let _ = tx.send(it);
    });
    device.complete(Some("gaid"));

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.is_ok(), "event failed: {outcome:?}");
    assert_eq!(client.session_state(), SessionState::Initialized);
    assert!(client.has_active_session());
    assert_eq!(server.paths(), vec!["v1/install", "v2/event/custom"]);
}

#[test]
fn failed_install_allows_another_attempt() {
    init_logs();
    let failing = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let server = {
        let failing = failing.clone();
        Arc::new(ScriptedServer::new(move |_, _| {
            if failing.load(Ordering::SeqCst) {
                ServerResponse::error(500, "unavailable")
            } else {
                ServerResponse::ok(json!({"session_id": "s2", "randomized_bundle_token": "b2"}))
            }
        }))
    };
    let device = Arc::new(Device::default());
    let client = config(&server, &device).to_client().unwrap();

    let (tx, rx) = mpsc::channel();
    client.init_session(InitOptions::new().callback(move |it| {
        let _ = tx.send(it);
    }));
    device.complete(None);

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        outcome,
        Err(Error::UnableToReachServers { status: 500, .. })
    ));
    assert_eq!(client.session_state(), SessionState::Uninitialized);
    assert_eq!(server.calls().len(), 1);

    failing.store(false, Ordering::SeqCst);
    start_session(&client, &device);
    assert_eq!(client.session_state(), SessionState::Initialized);
}

#[test]
fn url_burst_never_grows_queue_beyond_bound() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions().closed());
    let device = Arc::new(Device::default());
    let client = config(&server, &device).to_client().unwrap();
    let (tx, rx) = mpsc::channel();

    for n in 1..=30 {
        let tx = tx.clone();
        let link = LinkProperties {
            alias: Some(format!("link{n}")),
            ..LinkProperties::default()
        };
        client.create_short_url(&link, move |url| {
            let _ = tx.send((n, url));
        });
        assert!(client.queue_len() <= 25);
    }

    let mut evicted: Vec<i32> = rx
        .try_iter()
        .filter(|(_, url)| url.is_err())
        .map(|(n, _)| n)
        .collect();
    evicted.sort();
    assert_eq!(evicted, vec![2, 3, 4, 5, 6]);

    server.open();
    drop(tx);
    let delivered: Vec<(i32, String)> = rx
        .iter()
        .map(|(n, url)| (n, url.unwrap()))
        .collect();
    assert_eq!(delivered.len(), 25);
    assert_eq!(delivered[0], (1, "https://app.link/link1".to_owned()));
    assert_eq!(client.queue_len(), 0);
}

#[test]
fn watchdog_sends_session_request_without_advertising_id() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());
    let client = config(&server, &device)
        .collaborator_max_wait(Duration::from_millis(50))
        .to_client()
        .unwrap();

    client.init_session(InitOptions::new());

    assert!(wait_until(|| client.session_state() == SessionState::Initialized));
    let install = server.calls()[0].body.clone();
    assert!(!install.contains_key(keys::ADVERTISING_IDS));
    assert_eq!(install[keys::UNIDENTIFIED_DEVICE], json!(true));
}

#[test]
fn concurrent_events_are_sent_one_at_a_time() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions().with_delay(Duration::from_millis(5)));
    let device = Arc::new(Device::default());
    let client = Arc::new(config(&server, &device).to_client().unwrap());
    start_session(&client, &device);

    let (tx, rx) = mpsc::channel();
    let threads: Vec<_> = (0..8)
        .map(|n| {
            let client = client.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                client.log_event(Event::custom(format!("event{n}")), move |it| {
                    let _ = tx.send(it);
                })
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    drop(tx);

    assert_eq!(rx.iter().filter(Result::is_ok).count(), 8);
    assert_eq!(server.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(server.calls().len(), 9);
}

#[test]
fn queued_requests_survive_a_restart() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());

    let first = config(&server, &device)
        .store(store.clone())
        .to_client()
        .unwrap();
    first.log_event(Event::custom("offline"), |_| {});
    assert_eq!(first.queue_len(), 1);
    drop(first);

    let raw = store.get_string(pref_keys::REQUEST_QUEUE);
    let mut entries: Vec<Value> = serde_json::from_str(&raw).unwrap();
    entries.push(json!({"path": "v1/unknown", "payload": {}, "initiated_by_client": true}));
    store
        .set_string(pref_keys::REQUEST_QUEUE, &Value::Array(entries).to_string())
        .unwrap();

    let second = config(&server, &device)
        .store(store.clone())
        .to_client()
        .unwrap();
    let queued = second.queued_requests();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].path, RequestPath::TrackCustomEvent);
    assert_eq!(queued[0].locks, vec![WaitLock::SdkInit]);

    start_session(&second, &device);
    assert!(wait_until(|| server.paths().contains(&"v2/event/custom".to_owned())));
}

#[test]
fn app_key_change_resets_storage_but_keeps_link_identifiers() {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());

    let first = config(&server, &device)
        .store(store.clone())
        .to_client()
        .unwrap();
    start_session(&first, &device);
    drop(first);
    store
        .set_string(pref_keys::LINK_CLICK_IDENTIFIER, "click-1")
        .unwrap();
    let pending = json!([{"path": "v2/event/custom", "payload": {"name": "pending"}, "initiated_by_client": true}]);
    store
        .set_string(pref_keys::REQUEST_QUEUE, &pending.to_string())
        .unwrap();

    let second = ClientConfig::from_app_key("key_live_other")
        .base_url("http://localhost/")
        .transport(server.clone())
        .device_signals(device.clone())
        .store(store.clone())
        .to_client()
        .unwrap();

    assert_eq!(second.queue_len(), 0);
    assert_eq!(store.get_string(pref_keys::SESSION_ID), NO_STRING_VALUE);
    assert_eq!(store.get_string(pref_keys::LINK_CLICK_IDENTIFIER), "click-1");
    assert_eq!(second.latest_referring_params(), json!({}));
}

#[test]
fn waiting_for_referring_params_gives_up_after_timeout() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());
    let client = config(&server, &device).to_client().unwrap();

    client.init_session(InitOptions::new());
    let started = Instant::now();
    let params = client.latest_referring_params_sync(Duration::from_millis(100));

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(params, json!({}));

    device.complete(None);
    assert_eq!(
        client.latest_referring_params_sync(Duration::from_secs(5)),
        json!({"+clicked_branch_link": false})
    );
}

#[test]
fn deferred_session_start_is_replayed_once() {
    init_logs();
    let server = Arc::new(ScriptedServer::sessions());
    let device = Arc::new(Device::default());
    let client = config(&server, &device).to_client().unwrap();

    client.expect_delayed_init(true);
    client.init_session(InitOptions::new());
    client.init_session(InitOptions::new());
    assert_eq!(client.queue_len(), 0);

    client.notify_ready();
    client.notify_ready();
    assert_eq!(client.queue_len(), 1);

    device.complete(None);
    assert!(wait_until(|| client.session_state() == SessionState::Initialized));
    assert_eq!(server.paths(), vec!["v1/install"]);
}

#[test]
fn events_are_retried_then_reported_once() {
    init_logs();
    let server = Arc::new(ScriptedServer::new(|path, _| match path {
        "v1/install" => ServerResponse::ok(json!({"session_id": "s1", "randomized_bundle_token": "b1"})),
        _ => ServerResponse::error(503, "busy"),
    }));
    let device = Arc::new(Device::default());
    let client = config(&server, &device).max_retries(2).to_client().unwrap();
    start_session(&client, &device);

    let (tx, rx) = mpsc::channel();
    client.log_event(Event::standard("PURCHASE"), move |it| {
        let _ = tx.send(it);
    });

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(outcome.unwrap_err().code(), -112);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(
        server
            .paths()
            .iter()
            .filter(|it| *it == "v2/event/standard")
            .count(),
        3
    );
}
