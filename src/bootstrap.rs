//! Session bootstrap: decides whether a new session starts and builds the install or open
//! request together with its wait locks.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::Value;

use crate::{
    context::Context,
    device::{select_referrer_provider, SharedReferrerProvider},
    queue::RequestQueue,
    request::{fail_unqueued, keys, Payload, Request, RequestCallback, RequestId, RequestPath},
    session::SessionState,
    storage::pref_keys,
    wait_lock::WaitLock,
    Error, Result,
};

/// Launch data extracted from the platform intent that started the app.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchIntent {
    /// Referring params available synchronously (instant deep link).
    pub referring_params: Option<Value>,
    pub link_click_identifier: Option<String>,
    pub app_link: Option<String>,
    pub external_uri: Option<String>,
    pub push_identifier: Option<String>,
    /// Request a new session even if one is already initialized. Consumed by the bootstrap.
    pub force_new_session: bool,
    /// `false` while the host is still waiting for the final intent.
    pub ready: bool,
}

impl Default for LaunchIntent {
    fn default() -> Self {
        LaunchIntent {
            referring_params: None,
            link_click_identifier: None,
            app_link: None,
            external_uri: None,
            push_identifier: None,
            force_new_session: false,
            ready: true,
        }
    }
}

/// Options of one session bootstrap attempt.
///
/// ```
/// # use attribution_core::{InitOptions, LaunchIntent};
/// let options = InitOptions::new()
///     .intent(LaunchIntent {
///         link_click_identifier: Some("123".to_owned()),
///         ..LaunchIntent::default()
///     })
///     .callback(|params| println!("{params:?}"));
/// ```
#[derive(Default)]
pub struct InitOptions {
    pub(crate) callback: Option<RequestCallback>,
    pub(crate) intent: LaunchIntent,
    pub(crate) force: bool,
    pub(crate) delay: Option<Duration>,
    pub(crate) automatic: bool,
    pub(crate) reinit: bool,
}

impl std::fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitOptions")
            .field("intent", &self.intent)
            .field("force", &self.force)
            .field("delay", &self.delay)
            .field("automatic", &self.automatic)
            .field("reinit", &self.reinit)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl InitOptions {
    pub fn new() -> InitOptions {
        InitOptions::default()
    }

    /// Receives the latest referring params once the session is established.
    pub fn callback(mut self, callback: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn intent(mut self, intent: LaunchIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn force_new_session(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Hold the session request back for `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Mark the attempt as started by the SDK itself rather than by the host app.
    pub fn automatic(mut self, automatic: bool) -> Self {
        self.automatic = automatic;
        self
    }

    pub(crate) fn reinit(mut self) -> Self {
        self.reinit = true;
        self
    }
}

/// Result of one attempt, acted upon once the attempt lock is released.
enum Attempt {
    Started { instant: Option<Value> },
    Rejected { request: Option<Request>, error: Error },
}

pub(crate) struct SessionBootstrap {
    ctx: Arc<Context>,
    queue: RequestQueue,
    expect_delayed_init: AtomicBool,
    deferred: Mutex<Option<InitOptions>>,
    // Serializes bootstrap attempts.
    attempt: Mutex<()>,
}

impl SessionBootstrap {
    pub fn new(ctx: Arc<Context>, queue: RequestQueue) -> SessionBootstrap {
        SessionBootstrap {
            ctx,
            queue,
            expect_delayed_init: AtomicBool::new(false),
            deferred: Mutex::new(None),
            attempt: Mutex::new(()),
        }
    }

    pub fn expect_delayed_init(&self, expect: bool) {
        self.expect_delayed_init.store(expect, Ordering::Release);
    }

    /// Replay the cached bootstrap attempt, if any.
    pub fn notify_ready(&self) {
        self.expect_delayed_init.store(false, Ordering::Release);
        let deferred = self
            .deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(options) = deferred {
            log::debug!(target: "attribution", "replaying deferred session initialization");
            self.initialize(options);
        }
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn initialize(&self, mut options: InitOptions) {
        if self.expect_delayed_init.load(Ordering::Acquire) {
            let previous = self
                .deferred
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .replace(options);
            log::debug!(target: "attribution", replaced = previous.is_some(); "deferring session initialization until the host is ready");
            return;
        }

        let guard = self
            .attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outcome = self.start(&mut options);
        drop(guard);

        // Callbacks run outside of the attempt lock so that they may start another session.
        match outcome {
            Attempt::Started { instant } => {
                if let (Some(params), Some(callback)) = (instant, options.callback.take()) {
                    callback(Ok(params));
                }
            }
            Attempt::Rejected { request, error } => match request {
                Some(request) => fail_unqueued(request, error),
                None => {
                    if let Some(callback) = options.callback.take() {
                        callback(Err(error));
                    }
                }
            },
        }
    }

    fn start(&self, options: &mut InitOptions) -> Attempt {
        let ctx = &self.ctx;

        let intent_forced = std::mem::take(&mut options.intent.force_new_session);
        let forced = options.force || options.reinit || intent_forced;
        let state = ctx.state();
        let start = match state {
            SessionState::Uninitialized => true,
            _ if forced => true,
            SessionState::Initializing if !ctx.session.manager().has_active_session() => {
                log::debug!(target: "attribution", "restarting initialization without a session");
                ctx.session.reset();
                true
            }
            _ => false,
        };
        if !start {
            log::debug!(target: "attribution", state:% = state; "session already initialized");
            return Attempt::Rejected {
                request: None,
                error: Error::AlreadyInitialized,
            };
        }

        if ctx.state() != SessionState::Initializing {
            ctx.session.transition(SessionState::Initializing);
        }
        ctx.referring_params_latch.reset(1);
        ctx.set_user_agent(ctx.device.user_agent());

        // An instant deep link answers the caller right away; the request is sent without it.
        let instant = options
            .intent
            .referring_params
            .clone()
            .filter(|it| it.as_object().is_some_and(|it| !it.is_empty()));
        let mut callback = match instant {
            Some(_) => {
                log::debug!(target: "attribution", "instant deep link session");
                ctx.add_instrumentation(keys::INSTANT_DL_SESSION, "true");
                None
            }
            None => options
                .callback
                .take()
                .map(|callback| self.deliver_params(callback)),
        };

        self.remember_intent(&options.intent);
        if !forced {
            if let Some(existing) = self.queue.self_init_request_id() {
                log::debug!(target: "attribution", request_id:% = existing; "reusing queued session request");
                self.queue
                    .update_payload(existing, |payload| apply_intent(payload, &options.intent));
                match callback {
                    None => return Attempt::Started { instant },
                    Some(cb) => match self.queue.transplant_callback(existing, cb) {
                        Ok(()) => return Attempt::Started { instant },
                        Err(cb) => callback = Some(cb),
                    },
                }
            }
        }

        let path = if ctx.prefs.has_user() {
            RequestPath::RegisterOpen
        } else {
            RequestPath::RegisterInstall
        };
        let mut request =
            Request::new(path, self.init_payload(path)).initiated_by_client(!options.automatic);
        if let Some(callback) = callback {
            request = request.with_callback(callback);
        }
        if ctx.is_tracking_disabled() && !request.prepare_execute_without_tracking() {
            log::debug!(target: "attribution", "tracking is disabled, not starting a session");
            ctx.session.reset();
            ctx.referring_params_latch.count_down();
            return Attempt::Rejected {
                request: Some(request),
                error: Error::TrackingDisabled,
            };
        }

        request.add_lock(WaitLock::AdvertisingIdFetch);
        let referrer = if path == RequestPath::RegisterInstall {
            select_referrer_provider(&ctx.referrer_providers)
                .filter(|_| ctx.claim_referrer_fetch())
        } else {
            None
        };
        if referrer.is_some() {
            request.add_lock(WaitLock::InstallReferrerFetch);
        }
        if !options.intent.ready {
            request.add_lock(WaitLock::IntentPending);
        }
        let delay = options.delay.filter(|it| !it.is_zero());
        if delay.is_some() {
            request.add_lock(WaitLock::UserSetDelay);
        }

        let id = request.id();
        log::debug!(target: "attribution", request_id:% = id, path = path.as_str(), forced; "starting session");
        self.queue.insert_request_at_front(request);

        self.fetch_advertising_id(id);
        if let Some(provider) = referrer {
            self.fetch_install_referrer(id, provider);
        }
        if let Some(delay) = delay {
            self.release_after(id, WaitLock::UserSetDelay, delay, "user-delay");
        }
        Attempt::Started { instant }
    }

    fn deliver_params(&self, callback: RequestCallback) -> RequestCallback {
        let ctx = self.ctx.clone();
        Box::new(move |outcome: Result<Value>| {
            callback(outcome.map(|_| ctx.stored_params(pref_keys::SESSION_PARAMS)))
        })
    }

    fn remember_intent(&self, intent: &LaunchIntent) {
        let prefs = &self.ctx.prefs;
        for (key, value) in [
            (pref_keys::LINK_CLICK_IDENTIFIER, &intent.link_click_identifier),
            (pref_keys::APP_LINK, &intent.app_link),
            (pref_keys::PUSH_IDENTIFIER, &intent.push_identifier),
            (pref_keys::EXTERNAL_INTENT_URI, &intent.external_uri),
        ] {
            if let Some(value) = value {
                prefs.set(key, Some(value.as_str()));
            }
        }
    }

    fn init_payload(&self, path: RequestPath) -> Payload {
        let prefs = &self.ctx.prefs;
        let mut payload = Payload::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                payload.insert(key.to_owned(), Value::String(value));
            }
        };
        put(keys::LINK_IDENTIFIER, prefs.get(pref_keys::LINK_CLICK_IDENTIFIER));
        put(keys::APP_LINK, prefs.get(pref_keys::APP_LINK));
        put(keys::PUSH_IDENTIFIER, prefs.get(pref_keys::PUSH_IDENTIFIER));
        put(keys::EXTERNAL_INTENT_URI, prefs.get(pref_keys::EXTERNAL_INTENT_URI));
        put(keys::IDENTITY, prefs.get(pref_keys::IDENTITY));
        if path == RequestPath::RegisterOpen {
            put(keys::RANDOMIZED_DEVICE_TOKEN, prefs.randomized_device_token());
            put(keys::RANDOMIZED_BUNDLE_TOKEN, prefs.randomized_bundle_token());
        } else {
            put(keys::INSTALL_REFERRER, prefs.get(pref_keys::INSTALL_REFERRER));
        }
        payload
    }

    fn fetch_advertising_id(&self, id: RequestId) {
        let ctx = self.ctx.clone();
        let queue = self.queue.clone();
        self.ctx.device.fetch_advertising_id(Box::new(move |advertising_id| {
            ctx.set_advertising_id(advertising_id);
            if queue.unlock_request(id, WaitLock::AdvertisingIdFetch) {
                queue.process_next("advertising id fetched");
            }
        }));
        self.watchdog(id, WaitLock::AdvertisingIdFetch);
    }

    fn fetch_install_referrer(
        &self,
        id: RequestId,
        provider: SharedReferrerProvider,
    ) {
        let ctx = self.ctx.clone();
        let queue = self.queue.clone();
        provider.fetch(Box::new(move |referrer| {
            if let Some(referrer) = referrer {
                log::debug!(target: "attribution", store = referrer.store.as_str(); "install referrer received");
                ctx.prefs
                    .set(pref_keys::INSTALL_REFERRER, Some(&referrer.referrer));
                ctx.prefs
                    .set_long(pref_keys::REFERRER_CLICK_TS, referrer.click_timestamp);
                ctx.prefs
                    .set_long(pref_keys::INSTALL_BEGIN_TS, referrer.install_begin_timestamp);
                queue.update_payload(id, |payload| {
                    payload.insert(
                        keys::INSTALL_REFERRER.to_owned(),
                        Value::String(referrer.referrer.clone()),
                    );
                    payload.insert(
                        keys::REFERRER_CLICK_TS.to_owned(),
                        Value::from(referrer.click_timestamp),
                    );
                    payload.insert(
                        keys::INSTALL_BEGIN_TS.to_owned(),
                        Value::from(referrer.install_begin_timestamp),
                    );
                });
            }
            if queue.unlock_request(id, WaitLock::InstallReferrerFetch) {
                queue.process_next("install referrer fetched");
            }
        }));
        self.watchdog(id, WaitLock::InstallReferrerFetch);
    }

    /// Force-release `lock` if the collaborator does not call back in time.
    fn watchdog(&self, id: RequestId, lock: WaitLock) {
        self.release_after(id, lock, self.ctx.settings.collaborator_max_wait, "watchdog");
    }

    fn release_after(&self, id: RequestId, lock: WaitLock, delay: Duration, name: &str) {
        let queue = self.queue.clone();
        let scheduled = self.ctx.timers.schedule(name, delay, move || {
            if queue.unlock_request(id, lock) {
                log::debug!(target: "attribution", request_id:% = id, lock = lock.as_str(); "timer released wait lock");
                queue.process_next("timer");
            }
        });
        if let Err(err) = scheduled {
            log::error!(target: "attribution", lock = lock.as_str(); "failed to schedule timer, releasing lock: {err}");
            if self.queue.unlock_request(id, lock) {
                self.queue.process_next("timer unavailable");
            }
        }
    }
}

/// Copy the link values of `intent` into an already built session payload.
fn apply_intent(payload: &mut Payload, intent: &LaunchIntent) {
    for (key, value) in [
        (keys::LINK_IDENTIFIER, &intent.link_click_identifier),
        (keys::APP_LINK, &intent.app_link),
        (keys::PUSH_IDENTIFIER, &intent.push_identifier),
        (keys::EXTERNAL_INTENT_URI, &intent.external_uri),
    ] {
        if let Some(value) = value {
            payload.insert(key.to_owned(), Value::String(value.clone()));
        }
    }
}
