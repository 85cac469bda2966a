//! Fake collaborators for unit tests.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use reqwest::Url;
use serde_json::Value;

use crate::{
    config::{Collaborators, Settings},
    context::Context,
    device::{AdvertisingIdCallback, DeviceSignals},
    request::Payload,
    storage::MemoryStore,
    transport::{ServerResponse, Transport},
};

type Responder = Box<dyn Fn(&str, &Payload) -> ServerResponse + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub body: Payload,
    pub started: Instant,
    pub finished: Instant,
}

/// Transport answering from a closure and recording every call.
pub struct MockTransport {
    responder: Responder,
    delay: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new(
        responder: impl Fn(&str, &Payload) -> ServerResponse + Send + Sync + 'static,
    ) -> MockTransport {
        MockTransport {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Transport that answers every call with `200 {}`.
    pub fn ok() -> MockTransport {
        MockTransport::new(|_, _| ServerResponse::ok(serde_json::json!({})))
    }

    pub fn with_delay(mut self, delay: Duration) -> MockTransport {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|it| it.path).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn call(&self, url: &Url, payload: &Payload) -> ServerResponse {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let started = Instant::now();
        std::thread::sleep(self.delay);
        let path = url.path().trim_start_matches('/').to_owned();
        let response = (self.responder)(&path, payload);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(RecordedCall {
            path,
            body: payload.clone(),
            started,
            finished: Instant::now(),
        });
        response
    }
}

impl Transport for MockTransport {
    fn post(&self, url: &Url, payload: &Payload, _: &str, _: Duration) -> ServerResponse {
        self.call(url, payload)
    }

    fn get(&self, url: &Url, params: &Payload, _: &str, _: Duration) -> ServerResponse {
        self.call(url, params)
    }
}

/// Device signals whose advertising ID fetch completes only when the test says so.
#[derive(Default)]
pub struct FakeDeviceSignals {
    pending: Mutex<Vec<AdvertisingIdCallback>>,
}

impl FakeDeviceSignals {
    pub fn pending_fetches(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete every pending fetch with `id`.
    pub fn complete(&self, id: Option<&str>) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for done in pending {
            done(id.map(|id| crate::device::AdvertisingId {
                id: id.to_owned(),
                limit_ad_tracking: false,
            }));
        }
    }
}

impl DeviceSignals for FakeDeviceSignals {
    fn fetch_advertising_id(&self, done: AdvertisingIdCallback) {
        self.pending.lock().unwrap().push(done);
    }

    fn user_agent(&self) -> Option<String> {
        Some("test-agent".to_owned())
    }

    fn device_info(&self) -> Payload {
        let mut info = Payload::new();
        info.insert("os".to_owned(), Value::String("TestOS".to_owned()));
        info.insert("hardware_id".to_owned(), Value::String("hw-1".to_owned()));
        info
    }
}

pub fn settings() -> Settings {
    Settings {
        app_key: "key_test_unit".to_owned(),
        test_mode: true,
        base_url: Url::parse("http://localhost/").unwrap(),
        read_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        max_retries: 2,
        retry_interval: Duration::from_millis(20),
        retry_jitter: Duration::ZERO,
        collaborator_max_wait: Duration::from_millis(100),
    }
}

pub fn context_with(
    transport: Arc<MockTransport>,
    device: Arc<FakeDeviceSignals>,
    settings: Settings,
) -> Arc<Context> {
    Arc::new(Context::new(
        settings,
        Collaborators {
            store: Arc::new(MemoryStore::new()),
            transport,
            device_signals: device,
            referrer_providers: Vec::new(),
        },
    ))
}

pub fn context() -> Arc<Context> {
    context_with(
        Arc::new(MockTransport::ok()),
        Arc::new(FakeDeviceSignals::default()),
        settings(),
    )
}

/// Poll `condition` until it holds or a few seconds pass.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}
