//! A unit of work representing one API call to the attribution server.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    device::AdvertisingId,
    wait_lock::{WaitLock, WaitLocks},
    Error, Result,
};

/// Mutable JSON payload of a request.
pub type Payload = serde_json::Map<String, Value>;

/// Callback invoked exactly once with the terminal outcome of a request.
pub type RequestCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Well-known payload and response keys.
pub mod keys {
    pub const SESSION_ID: &str = "session_id";
    pub const RANDOMIZED_DEVICE_TOKEN: &str = "randomized_device_token";
    pub const RANDOMIZED_BUNDLE_TOKEN: &str = "randomized_bundle_token";
    pub const IDENTITY: &str = "identity";
    pub const IDENTITY_ID: &str = "identity_id";
    pub const LINK: &str = "link";
    pub const DATA: &str = "data";
    pub const URL: &str = "url";
    pub const METADATA: &str = "metadata";
    pub const INSTRUMENTATION: &str = "instrumentation";
    pub const PARTNER_DATA: &str = "partner_data";
    pub const USER_DATA: &str = "user_data";
    pub const ADVERTISING_IDS: &str = "advertising_ids";
    pub const AAID: &str = "aaid";
    pub const LAT_VAL: &str = "lat_val";
    pub const UNIDENTIFIED_DEVICE: &str = "unidentified_device";
    pub const HARDWARE_ID: &str = "hardware_id";
    pub const LINK_IDENTIFIER: &str = "link_identifier";
    pub const APP_LINK: &str = "android_app_link_url";
    pub const PUSH_IDENTIFIER: &str = "android_push_identifier";
    pub const EXTERNAL_INTENT_URI: &str = "external_intent_uri";
    pub const INSTALL_REFERRER: &str = "install_referrer_extras";
    pub const REFERRER_CLICK_TS: &str = "referrer_click_ts";
    pub const INSTALL_BEGIN_TS: &str = "install_begin_ts";
    pub const USER_AGENT: &str = "user_agent";
    pub const INSTANT_DL_SESSION: &str = "instant_dl_session";
    pub const QUEUE_WAIT_TIME_SUFFIX: &str = "-qwt";
    pub const NAME: &str = "name";
    pub const EVENT_DATA: &str = "event_data";
    pub const CUSTOM_DATA: &str = "custom_data";
}

/// Server endpoints the core can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestPath {
    /// First session of an install.
    RegisterInstall,
    /// Any later session.
    RegisterOpen,
    /// Session close on app backgrounding.
    RegisterClose,
    /// Short URL creation.
    GetUrl,
    /// App link settings lookup.
    GetApp,
    /// Set developer identity.
    IdentifyUser,
    /// Clear developer identity.
    Logout,
    /// Legacy completed-action event.
    CompletedAction,
    /// Standard commerce/content event.
    TrackStandardEvent,
    /// Custom event.
    TrackCustomEvent,
}

impl RequestPath {
    /// All known endpoints.
    pub const ALL: [RequestPath; 10] = [
        RequestPath::RegisterInstall,
        RequestPath::RegisterOpen,
        RequestPath::RegisterClose,
        RequestPath::GetUrl,
        RequestPath::GetApp,
        RequestPath::IdentifyUser,
        RequestPath::Logout,
        RequestPath::CompletedAction,
        RequestPath::TrackStandardEvent,
        RequestPath::TrackCustomEvent,
    ];

    /// URL path relative to the API base URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPath::RegisterInstall => "v1/install",
            RequestPath::RegisterOpen => "v1/open",
            RequestPath::RegisterClose => "v1/close",
            RequestPath::GetUrl => "v1/url",
            RequestPath::GetApp => "v1/app-link-settings",
            RequestPath::IdentifyUser => "v1/profile",
            RequestPath::Logout => "v1/logout",
            RequestPath::CompletedAction => "v1/event",
            RequestPath::TrackStandardEvent => "v2/event/standard",
            RequestPath::TrackCustomEvent => "v2/event/custom",
        }
    }

    /// Parse a URL path. Unknown paths return `None`.
    pub fn from_path(path: &str) -> Option<RequestPath> {
        RequestPath::ALL
            .into_iter()
            .find(|it| it.as_str().eq_ignore_ascii_case(path))
    }

    /// Install or open.
    pub fn is_session_init(&self) -> bool {
        matches!(self, RequestPath::RegisterInstall | RequestPath::RegisterOpen)
    }

    /// Whether the request can only run once a session is established.
    pub fn needs_session(&self) -> bool {
        !matches!(
            self,
            RequestPath::RegisterInstall
                | RequestPath::RegisterOpen
                | RequestPath::GetUrl
                | RequestPath::GetApp
        )
    }

    /// Whether a transient failure leaves the request queued for another attempt.
    pub fn should_retry_on_fail(&self) -> bool {
        matches!(
            self,
            RequestPath::CompletedAction
                | RequestPath::TrackStandardEvent
                | RequestPath::TrackCustomEvent
        )
    }

    /// Whether the request survives a process restart.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, RequestPath::RegisterClose | RequestPath::GetApp)
    }

    /// Whether the request is sent with `GET`.
    pub fn is_get(&self) -> bool {
        matches!(self, RequestPath::GetApp)
    }

    /// v2 endpoints carry device data under `user_data` instead of at the top level.
    pub fn is_v2(&self) -> bool {
        matches!(
            self,
            RequestPath::TrackStandardEvent | RequestPath::TrackCustomEvent
        )
    }
}

impl std::fmt::Display for RequestPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-unique identifier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> RequestId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Persisted form of a queued request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRequest {
    /// Endpoint path, e.g. `v1/install`.
    pub path: String,
    /// Request payload at the time of persisting.
    pub payload: Payload,
    /// Whether the request was initiated explicitly by the client.
    #[serde(default)]
    pub initiated_by_client: bool,
}

/// One API call to the attribution server.
///
/// A request is owned by the [`RequestQueue`](crate::RequestQueue) once enqueued. It is never
/// executed while it holds a [wait lock](WaitLock).
pub struct Request {
    id: RequestId,
    path: RequestPath,
    payload: Payload,
    retry_count: u32,
    locks: WaitLocks,
    queued_at: Option<DateTime<Utc>>,
    retry_at: Option<Instant>,
    initiated_by_client: bool,
    construction_error: Option<String>,
    callback: Option<RequestCallback>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("retry_count", &self.retry_count)
            .field("retry_at", &self.retry_at)
            .field("locks", &self.locks)
            .field("initiated_by_client", &self.initiated_by_client)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Request {
    /// Create a request for `path` with the given payload.
    pub fn new(path: RequestPath, payload: Payload) -> Request {
        Request {
            id: RequestId::next(),
            path,
            payload,
            retry_count: 0,
            locks: WaitLocks::new(),
            queued_at: None,
            retry_at: None,
            initiated_by_client: true,
            construction_error: None,
            callback: None,
        }
    }

    /// Create a request whose payload could not be assembled. It fails without being sent.
    pub fn construction_failed(path: RequestPath, reason: impl Into<String>) -> Request {
        let mut request = Request::new(path, Payload::new());
        request.construction_error = Some(reason.into());
        request
    }

    /// Attach a callback.
    pub fn with_callback(mut self, callback: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Mark whether the request was initiated explicitly by the client (`true`) or automatically
    /// by the SDK (`false`).
    pub fn initiated_by_client(mut self, initiated_by_client: bool) -> Self {
        self.initiated_by_client = initiated_by_client;
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn path(&self) -> RequestPath {
        self.path
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn is_initiated_by_client(&self) -> bool {
        self.initiated_by_client
    }

    pub fn construction_error(&self) -> Option<&str> {
        self.construction_error.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn increment_retry_count(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Keep the request from being dispatched before `at`.
    pub(crate) fn defer_until(&mut self, at: Instant) {
        self.retry_at = Some(at);
    }

    /// Make a deferred request eligible again.
    pub(crate) fn resume(&mut self) {
        self.retry_at = None;
    }

    /// Returns `true` while a scheduled retry has not come due.
    pub(crate) fn is_deferred(&self) -> bool {
        self.retry_at.is_some_and(|at| Instant::now() < at)
    }

    /// Attach a wait lock. Idempotent.
    pub fn add_lock(&mut self, lock: WaitLock) {
        self.locks.add(lock);
    }

    /// Remove a wait lock, returning whether it was held. Idempotent.
    pub fn remove_lock(&mut self, lock: WaitLock) -> bool {
        self.locks.remove(lock)
    }

    /// Returns `true` while any wait lock is held.
    pub fn is_blocked(&self) -> bool {
        self.locks.is_blocked()
    }

    pub fn locks(&self) -> &WaitLocks {
        &self.locks
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Replace the callback, returning the previous one without invoking it.
    pub(crate) fn replace_callback(
        &mut self,
        callback: Option<RequestCallback>,
    ) -> Option<RequestCallback> {
        std::mem::replace(&mut self.callback, callback)
    }

    pub(crate) fn mark_queued(&mut self) {
        if self.queued_at.is_none() {
            self.queued_at = Some(Utc::now());
        }
    }

    /// Milliseconds spent in the queue so far, 0 if never queued.
    pub fn queue_wait_time_ms(&self) -> i64 {
        self.queued_at
            .map(|queued_at| (Utc::now() - queued_at).num_milliseconds().max(0))
            .unwrap_or(0)
    }

    /// Deliver the terminal outcome to the callback. Subsequent calls do nothing.
    pub(crate) fn complete(&mut self, outcome: Result<Value>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }

    /// Prepare the request to run while tracking is disabled. Returns `false` if the request
    /// cannot run without tracking.
    ///
    /// Only session-init requests that carry a link identifier, app link or push identifier may
    /// run tracking-free; device identifiers are stripped from their payload.
    pub fn prepare_execute_without_tracking(&mut self) -> bool {
        if !self.path.is_session_init() {
            return false;
        }
        let has_link = [keys::LINK_IDENTIFIER, keys::APP_LINK, keys::PUSH_IDENTIFIER]
            .iter()
            .any(|key| self.payload.contains_key(*key));
        if !has_link {
            return false;
        }
        for key in [
            keys::RANDOMIZED_DEVICE_TOKEN,
            keys::RANDOMIZED_BUNDLE_TOKEN,
            keys::HARDWARE_ID,
            keys::ADVERTISING_IDS,
            keys::LAT_VAL,
            keys::IDENTITY,
            keys::EXTERNAL_INTENT_URI,
            keys::INSTALL_REFERRER,
        ] {
            self.payload.remove(key);
        }
        true
    }

    /// Replace the value of `key` if the payload already carries it. Returns whether the payload
    /// changed.
    pub(crate) fn rewrite_if_present(&mut self, key: &str, value: &str) -> bool {
        match self.payload.get_mut(key) {
            Some(Value::String(current)) if current == value => false,
            Some(slot) => {
                *slot = Value::String(value.to_owned());
                true
            }
            None => false,
        }
    }

    pub fn to_persisted(&self) -> Option<PersistedRequest> {
        if !self.path.is_persistable() || self.construction_error.is_some() {
            return None;
        }
        Some(PersistedRequest {
            path: self.path.as_str().to_owned(),
            payload: self.payload.clone(),
            initiated_by_client: self.initiated_by_client,
        })
    }

    /// Rebuild a request from its persisted form. Unknown paths yield `None`.
    pub fn from_persisted(entry: PersistedRequest) -> Option<Request> {
        let path = RequestPath::from_path(&entry.path)?;
        Some(Request::new(path, entry.payload).initiated_by_client(entry.initiated_by_client))
    }

    /// Build the body that is actually sent, merging sources in a fixed order: device info,
    /// partner parameters, metadata, instrumentation.
    pub(crate) fn build_outgoing(&self, sources: PayloadSources<'_>) -> Payload {
        let mut body = self.payload.clone();

        // 1. device info; fields the caller set explicitly win
        {
            let target = if self.path.is_v2() {
                object_entry(&mut body, keys::USER_DATA)
            } else {
                &mut body
            };
            for (key, value) in sources.device_info {
                target.entry(key.clone()).or_insert_with(|| value.clone());
            }
            apply_advertising_id(target, sources.advertising_id);
        }

        // 2. partner parameters
        if !sources.partner_params.is_empty() {
            body.insert(
                keys::PARTNER_DATA.to_owned(),
                Value::Object(sources.partner_params.clone()),
            );
        }

        // 3. metadata; request-level keys override global ones
        let mut metadata = sources.metadata.clone();
        if let Some(Value::Object(own)) = self.payload.get(keys::METADATA) {
            for (key, value) in own {
                metadata.insert(key.clone(), value.clone());
            }
        }
        if !metadata.is_empty() {
            body.insert(keys::METADATA.to_owned(), Value::Object(metadata));
        }

        // 4. instrumentation
        let mut instrumentation = sources.instrumentation;
        instrumentation.insert(
            format!("{}{}", self.path.as_str(), keys::QUEUE_WAIT_TIME_SUFFIX),
            Value::String(self.queue_wait_time_ms().to_string()),
        );
        body.insert(
            keys::INSTRUMENTATION.to_owned(),
            Value::Object(instrumentation),
        );

        body
    }
}

/// Inputs merged into the outgoing body at dispatch time.
pub(crate) struct PayloadSources<'a> {
    pub device_info: &'a Payload,
    pub partner_params: &'a Payload,
    pub metadata: &'a Payload,
    pub instrumentation: Payload,
    pub advertising_id: Option<&'a AdvertisingId>,
}

fn object_entry<'a>(payload: &'a mut Payload, key: &str) -> &'a mut Payload {
    let slot = payload
        .entry(key.to_owned())
        .or_insert_with(|| Value::Object(Payload::new()));
    if !slot.is_object() {
        *slot = Value::Object(Payload::new());
    }
    match slot {
        Value::Object(map) => map,
        _ => unreachable!("slot was just replaced with an object"),
    }
}

fn apply_advertising_id(target: &mut Payload, advertising_id: Option<&AdvertisingId>) {
    match advertising_id.filter(|it| !it.id.is_empty()) {
        Some(advertising_id) => {
            let mut ids = Payload::new();
            ids.insert(keys::AAID.to_owned(), Value::String(advertising_id.id.clone()));
            target.insert(keys::ADVERTISING_IDS.to_owned(), Value::Object(ids));
            target.insert(
                keys::LAT_VAL.to_owned(),
                Value::from(u8::from(advertising_id.limit_ad_tracking)),
            );
            target.remove(keys::UNIDENTIFIED_DEVICE);
        }
        None => {
            if !target.contains_key(keys::HARDWARE_ID) {
                target.insert(keys::UNIDENTIFIED_DEVICE.to_owned(), Value::Bool(true));
            }
        }
    }
}

/// Fail a request that never reached the queue.
pub(crate) fn fail_unqueued(mut request: Request, error: Error) {
    log::debug!(target: "attribution",
                path = request.path().as_str(),
                code = error.code();
                "failing request before it is queued");
    request.complete(Err(error));
}
