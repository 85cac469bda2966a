//! State shared by every component of one [`Client`](crate::Client).
use std::sync::{atomic::AtomicBool, atomic::Ordering, Mutex};

use serde_json::Value;

use crate::{
    config::{Collaborators, Settings},
    device::{AdvertisingId, SharedDeviceSignals, SharedReferrerProvider},
    latch::CountDownLatch,
    link_cache::LinkCache,
    request::Payload,
    session::{SessionState, SessionStateManager, TrackedSession},
    storage::{pref_keys, Preferences},
    timer::Timers,
    transport::SharedTransport,
};

pub(crate) struct Context {
    pub settings: Settings,
    pub prefs: Preferences,
    pub session: TrackedSession,
    pub link_cache: LinkCache,
    pub transport: SharedTransport,
    pub device: SharedDeviceSignals,
    pub referrer_providers: Vec<SharedReferrerProvider>,
    pub timers: Timers,
    pub referring_params_latch: CountDownLatch,
    instrumentation: Mutex<Payload>,
    metadata: Mutex<Payload>,
    partner_params: Mutex<Payload>,
    advertising_id: Mutex<Option<AdvertisingId>>,
    user_agent: Mutex<Option<String>>,
    tracking_disabled: AtomicBool,
    referrer_fetched: AtomicBool,
}

fn locked<T, R>(mutex: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

impl Context {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Context {
        let prefs = Preferences::new(collaborators.store);
        let tracking_disabled = prefs.get_bool(pref_keys::TRACKING_DISABLED);
        Context {
            session: TrackedSession::new(SessionStateManager::new(prefs.clone())),
            prefs,
            settings,
            link_cache: LinkCache::new(),
            transport: collaborators.transport,
            device: collaborators.device_signals,
            referrer_providers: collaborators.referrer_providers,
            timers: Timers::new(),
            referring_params_latch: CountDownLatch::new(0),
            instrumentation: Mutex::new(Payload::new()),
            metadata: Mutex::new(Payload::new()),
            partner_params: Mutex::new(Payload::new()),
            advertising_id: Mutex::new(None),
            user_agent: Mutex::new(None),
            tracking_disabled: AtomicBool::new(tracking_disabled),
            referrer_fetched: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.tracking_disabled.load(Ordering::Acquire)
    }

    pub fn set_tracking_disabled(&self, disabled: bool) {
        self.tracking_disabled.store(disabled, Ordering::Release);
        self.prefs.set_bool(pref_keys::TRACKING_DISABLED, disabled);
    }

    /// Returns `true` the first time it is called.
    pub fn claim_referrer_fetch(&self) -> bool {
        !self.referrer_fetched.swap(true, Ordering::AcqRel)
    }

    pub fn add_instrumentation(&self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        locked(&self.instrumentation, |it| it.insert(key, Value::String(value)));
    }

    /// Take all instrumentation collected since the previous dispatch.
    pub fn drain_instrumentation(&self) -> Payload {
        locked(&self.instrumentation, std::mem::take)
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        locked(&self.metadata, |it| it.insert(key, value));
    }

    pub fn metadata(&self) -> Payload {
        locked(&self.metadata, |it| it.clone())
    }

    /// Add a partner parameter under `partner` (e.g. `fb`, `snap`).
    pub fn set_partner_parameter(&self, partner: &str, key: impl Into<String>, value: Value) {
        let key = key.into();
        locked(&self.partner_params, |params| {
            let entry = params
                .entry(partner.to_owned())
                .or_insert_with(|| Value::Object(Payload::new()));
            if let Value::Object(map) = entry {
                map.insert(key, value);
            }
        });
    }

    pub fn partner_params(&self) -> Payload {
        locked(&self.partner_params, |it| it.clone())
    }

    pub fn set_advertising_id(&self, advertising_id: Option<AdvertisingId>) {
        locked(&self.advertising_id, |it| *it = advertising_id);
    }

    pub fn advertising_id(&self) -> Option<AdvertisingId> {
        locked(&self.advertising_id, |it| it.clone())
    }

    pub fn set_user_agent(&self, user_agent: Option<String>) {
        locked(&self.user_agent, |it| *it = user_agent);
    }

    pub fn user_agent(&self) -> Option<String> {
        locked(&self.user_agent, |it| it.clone())
    }

    /// Device information merged into outgoing requests.
    pub fn device_info(&self) -> Payload {
        let mut info = self.device.device_info();
        if let Some(user_agent) = self.user_agent() {
            info.entry(crate::request::keys::USER_AGENT.to_owned())
                .or_insert(Value::String(user_agent));
        }
        info
    }

    /// Parsed JSON object stored under `key`, or an empty object.
    pub fn stored_params(&self, key: &str) -> Value {
        self.prefs
            .get(key)
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Payload::new()))
    }

    pub fn store_params(&self, key: &str, params: Option<&Value>) {
        match params {
            Some(params) => {
                let raw = match params {
                    Value::String(raw) => raw.clone(),
                    other => other.to_string(),
                };
                self.prefs.set(key, Some(&raw));
            }
            None => self.prefs.set(key, None),
        }
    }
}
