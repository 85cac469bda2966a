use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::Value;

use crate::{
    bootstrap::{InitOptions, LaunchIntent, SessionBootstrap},
    context::Context,
    queue::{QueuedRequest, RequestQueue},
    request::{keys, Payload, Request, RequestPath},
    session::{ObserverId, SessionState, SessionStateManager, SessionStateObserver},
    storage::{pref_keys, NO_STRING_VALUE},
    wait_lock::WaitLock,
    ClientConfig, Error, Result,
};

/// A client for the attribution API.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```no_run
/// # use attribution_core::{ClientConfig, InitOptions};
/// let client = ClientConfig::from_app_key("key_live_abc123").to_client().unwrap();
/// client.init_session(InitOptions::new().callback(|params| {
///     println!("session started: {params:?}");
/// }));
/// ```
pub struct Client {
    ctx: Arc<Context>,
    queue: RequestQueue,
    bootstrap: SessionBootstrap,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Requests persisted by a previous client with the same store are restored. If the app key
    /// differs from the stored one, the store is wiped (except link identifiers) first.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let (settings, collaborators) = config.into_parts()?;
        let ctx = Arc::new(Context::new(settings, collaborators));

        if ctx.prefs.set_app_key(&ctx.settings.app_key) {
            log::info!(target: "attribution", "app key changed, resetting stored state");
            ctx.link_cache.clear();
        }

        let queue = RequestQueue::new(ctx.clone());
        log::debug!(target: "attribution", restored = queue.len(); "client created");
        Ok(Client {
            bootstrap: SessionBootstrap::new(ctx.clone(), queue.clone()),
            ctx,
            queue,
        })
    }

    /// Start a session.
    ///
    /// The callback receives the latest referring params, or [`Error::AlreadyInitialized`] when
    /// a session is already established and the attempt is not forced.
    pub fn init_session(&self, options: InitOptions) {
        self.bootstrap.initialize(options);
    }

    /// Force a new session, e.g. when the app is brought to the foreground by a new link.
    pub fn reinit_session(
        &self,
        intent: LaunchIntent,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) {
        self.bootstrap.initialize(
            InitOptions::new()
                .intent(intent)
                .callback(callback)
                .reinit(),
        );
    }

    /// While `true`, session starts are cached until [`Client::notify_ready`] is called.
    pub fn expect_delayed_init(&self, expect: bool) {
        self.bootstrap.expect_delayed_init(expect);
    }

    /// Replay the latest session start cached while the host was not ready.
    pub fn notify_ready(&self) {
        self.bootstrap.notify_ready();
    }

    /// The launch intent is final. Releases session requests waiting for it.
    pub fn intent_ready(&self) {
        if self.queue.unlock_wait(WaitLock::IntentPending) {
            self.queue.process_next("intent ready");
        }
    }

    /// Send an analytics event.
    pub fn log_event(&self, event: Event, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let path = if event.standard {
            RequestPath::TrackStandardEvent
        } else {
            RequestPath::TrackCustomEvent
        };
        let mut payload = self.session_tokens();
        payload.insert(keys::NAME.to_owned(), Value::String(event.name));
        if !event.event_data.is_empty() {
            payload.insert(keys::EVENT_DATA.to_owned(), Value::Object(event.event_data));
        }
        if !event.custom_data.is_empty() {
            payload.insert(keys::CUSTOM_DATA.to_owned(), Value::Object(event.custom_data));
        }

        self.queue.handle_new_request(
            Request::new(path, payload).with_callback(move |outcome| callback(outcome.map(|_| ()))),
        );
    }

    /// Report a legacy completed action with optional metadata.
    pub fn user_completed_action(&self, action: &str, metadata: Option<Payload>) {
        let mut payload = self.session_tokens();
        payload.insert("event".to_owned(), Value::String(action.to_owned()));
        if let Some(metadata) = metadata {
            payload.insert(keys::METADATA.to_owned(), Value::Object(metadata));
        }
        self.queue
            .handle_new_request(Request::new(RequestPath::CompletedAction, payload));
    }

    /// Identify the current user. The callback receives the first referring params of the user.
    pub fn set_identity(
        &self,
        identity: &str,
        callback: impl FnOnce(Result<Value>) + Send + 'static,
    ) {
        if identity.is_empty() {
            callback(Err(Error::InvalidRequest("identity must not be empty".to_owned())));
            return;
        }
        if self.ctx.prefs.get(pref_keys::IDENTITY).as_deref() == Some(identity) {
            log::debug!(target: "attribution", "identity unchanged");
            callback(Ok(self.first_referring_params()));
            return;
        }

        let mut payload = self.session_tokens();
        payload.insert(keys::IDENTITY.to_owned(), Value::String(identity.to_owned()));
        let ctx = self.ctx.clone();
        self.queue.handle_new_request(
            Request::new(RequestPath::IdentifyUser, payload).with_callback(move |outcome| {
                callback(outcome.map(|_| ctx.stored_params(pref_keys::INSTALL_PARAMS)))
            }),
        );
    }

    /// Clear the identity of the current user. On success the link cache and the request queue
    /// are cleared and the session ends.
    pub fn logout(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        self.queue.handle_new_request(
            Request::new(RequestPath::Logout, self.session_tokens())
                .with_callback(move |outcome| callback(outcome.map(|_| ()))),
        );
    }

    /// End the current session. The next [`Client::init_session`] starts a new one.
    pub fn close_session(&self) {
        if self.ctx.prefs.has_session() && self.ctx.state() == SessionState::Initialized {
            self.queue.handle_new_request(Request::new(
                RequestPath::RegisterClose,
                self.session_tokens(),
            ));
        }
        self.ctx.session.reset();
    }

    /// Create a short URL for `link`. Identical links are answered from the cache.
    pub fn create_short_url(
        &self,
        link: &LinkProperties,
        callback: impl FnOnce(Result<String>) + Send + 'static,
    ) {
        let mut payload = match serde_json::to_value(link) {
            Ok(Value::Object(payload)) => payload,
            Ok(_) => Payload::new(),
            Err(err) => {
                callback(Err(err.into()));
                return;
            }
        };
        let tokens = self.session_tokens();
        if let Some(identity_id) = self.ctx.prefs.get(pref_keys::IDENTITY_ID) {
            payload.insert(keys::IDENTITY_ID.to_owned(), Value::String(identity_id));
        }
        payload.extend(tokens);

        if let Some(url) = self.ctx.link_cache.get(&payload) {
            log::debug!(target: "attribution", "short url served from cache");
            callback(Ok(url));
            return;
        }

        self.queue.handle_new_request(
            Request::new(RequestPath::GetUrl, payload).with_callback(move |outcome| {
                callback(outcome.and_then(|body| {
                    body.get(keys::URL)
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .ok_or_else(|| {
                            Error::InvalidRequest("response carries no url".to_owned())
                        })
                }))
            }),
        );
    }

    /// Disable or re-enable tracking. Disabling drops queued requests and stored session data;
    /// re-enabling starts a new session.
    pub fn set_tracking_disabled(&self, disabled: bool) {
        if self.ctx.is_tracking_disabled() == disabled {
            return;
        }
        self.ctx.set_tracking_disabled(disabled);
        log::info!(target: "attribution", disabled = disabled; "tracking state changed");
        if disabled {
            self.queue.clear();
            self.ctx.link_cache.clear();
            for key in [
                pref_keys::SESSION_ID,
                pref_keys::IDENTITY,
                pref_keys::IDENTITY_ID,
                pref_keys::USER_URL,
                pref_keys::SESSION_PARAMS,
                pref_keys::INSTALL_PARAMS,
                pref_keys::LINK_CLICK_ID,
                pref_keys::LINK_CLICK_IDENTIFIER,
                pref_keys::APP_LINK,
                pref_keys::PUSH_IDENTIFIER,
                pref_keys::EXTERNAL_INTENT_URI,
            ] {
                self.ctx.prefs.set(key, None);
            }
            self.ctx.session.reset();
        } else {
            self.init_session(InitOptions::new().automatic(true));
        }
    }

    pub fn is_tracking_disabled(&self) -> bool {
        self.ctx.is_tracking_disabled()
    }

    /// Referring params of the latest session. Empty if none.
    pub fn latest_referring_params(&self) -> Value {
        self.ctx.stored_params(pref_keys::SESSION_PARAMS)
    }

    /// Referring params of the install (or of the identified user).
    pub fn first_referring_params(&self) -> Value {
        self.ctx.stored_params(pref_keys::INSTALL_PARAMS)
    }

    /// Wait up to `timeout` for an in-flight session start, then return the latest params.
    pub fn latest_referring_params_sync(&self, timeout: Duration) -> Value {
        if !self.ctx.referring_params_latch.wait_timeout(timeout) {
            log::debug!(target: "attribution", "timed out waiting for referring params");
        }
        self.latest_referring_params()
    }

    /// Record an instrumentation value sent with the next request.
    pub fn add_instrumentation_data(&self, key: impl Into<String>, value: impl Into<String>) {
        self.queue.add_instrumentation_data(key, value);
    }

    /// Metadata merged into every outgoing request.
    pub fn set_request_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.ctx.set_metadata(key, value.into());
    }

    /// Partner parameter merged into every outgoing request under `partner_data.<partner>`.
    pub fn set_partner_parameter(
        &self,
        partner: &str,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) {
        self.ctx.set_partner_parameter(partner, key, value.into());
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Copy of the queued requests, head first.
    pub fn queued_requests(&self) -> Vec<QueuedRequest> {
        self.queue.snapshot()
    }

    /// The request queue, for hosts that build their own requests.
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn session(&self) -> &SessionStateManager {
        self.ctx.session.manager()
    }

    pub fn session_state(&self) -> SessionState {
        self.ctx.state()
    }

    pub fn has_active_session(&self) -> bool {
        self.ctx.session.manager().has_active_session()
    }

    pub fn add_session_observer(
        &self,
        observer: impl SessionStateObserver + Send + Sync + 'static,
    ) -> ObserverId {
        self.ctx.session.manager().add_observer(observer)
    }

    pub fn remove_session_observer(&self, id: ObserverId) -> bool {
        self.ctx.session.manager().remove_observer(id)
    }

    /// Stop processing. Pending timers are cancelled and queued requests are dropped without
    /// invoking their callbacks.
    pub fn shutdown(&self) {
        log::debug!(target: "attribution", "shutting down client");
        self.ctx.timers.cancel_all();
        self.queue.shutdown();
        self.ctx.session.reset();
    }

    /// Session tokens, with a placeholder for tokens not known yet.
    fn session_tokens(&self) -> Payload {
        let prefs = &self.ctx.prefs;
        let mut payload = Payload::new();
        for (key, value) in [
            (keys::SESSION_ID, prefs.session_id()),
            (keys::RANDOMIZED_DEVICE_TOKEN, prefs.randomized_device_token()),
            (keys::RANDOMIZED_BUNDLE_TOKEN, prefs.randomized_bundle_token()),
        ] {
            payload.insert(
                key.to_owned(),
                Value::String(value.unwrap_or_else(|| NO_STRING_VALUE.to_owned())),
            );
        }
        payload
    }
}

/// Analytics event sent with [`Client::log_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    standard: bool,
    event_data: Payload,
    custom_data: Payload,
}

impl Event {
    /// One of the predefined commerce or content events, e.g. `PURCHASE`.
    pub fn standard(name: impl Into<String>) -> Event {
        Event {
            name: name.into(),
            standard: true,
            event_data: Payload::new(),
            custom_data: Payload::new(),
        }
    }

    pub fn custom(name: impl Into<String>) -> Event {
        Event {
            standard: false,
            ..Event::standard(name)
        }
    }

    /// Predefined event property such as `revenue` or `currency`.
    pub fn event_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event_data.insert(key.into(), value.into());
        self
    }

    pub fn custom_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_data
            .insert(key.into(), Value::String(value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Properties of a short link.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Link lifetime in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Payload::is_empty")]
    pub data: Payload,
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc},
        time::Duration,
    };

    use serde_json::json;

    use super::{Client, Event, LinkProperties};
    use crate::{
        request::keys,
        storage::pref_keys,
        test_support::{context_with, settings, wait_until, FakeDeviceSignals, MockTransport},
        transport::ServerResponse,
        bootstrap::SessionBootstrap,
        queue::RequestQueue,
        InitOptions, LaunchIntent, SessionState,
    };

    fn client_with(transport: Arc<MockTransport>, device: Arc<FakeDeviceSignals>) -> Client {
        let ctx = context_with(transport, device, settings());
        let queue = RequestQueue::new(ctx.clone());
        Client {
            bootstrap: SessionBootstrap::new(ctx.clone(), queue.clone()),
            ctx,
            queue,
        }
    }

    fn session_server() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|path, _| match path {
            "v1/install" | "v1/open" => ServerResponse::ok(json!({
                "session_id": "s1",
                "randomized_bundle_token": "b1",
                "randomized_device_token": "d1",
                "data": "{\"+clicked_branch_link\":true}",
            })),
            "v1/url" => ServerResponse::ok(json!({"url": "https://app.link/abc"})),
            _ => ServerResponse::ok(json!({})),
        }))
    }

    fn started(transport: Arc<MockTransport>, device: Arc<FakeDeviceSignals>) -> Client {
        let client = client_with(transport, device.clone());
        let (tx, rx) = mpsc::channel();
        client.init_session(InitOptions::new().callback(move |params| {
            let _ = tx.send(params);
        }));
        device.complete(Some("gaid"));
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        client
    }

    #[test]
    fn first_session_is_an_install_and_later_ones_are_opens() {
        let transport = session_server();
        let device = Arc::new(FakeDeviceSignals::default());
        let client = started(transport.clone(), device.clone());

        assert_eq!(client.session_state(), SessionState::Initialized);
        assert!(client.has_active_session());
        assert_eq!(
            client.latest_referring_params(),
            json!({"+clicked_branch_link": true})
        );
        assert_eq!(client.first_referring_params(), client.latest_referring_params());

        let (tx, rx) = mpsc::channel();
        client.reinit_session(LaunchIntent::default(), move |params| {
            let _ = tx.send(params);
        });
        device.complete(None);
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        assert_eq!(transport.paths(), vec!["v1/install", "v1/open"]);
        let open = transport.calls()[1].body.clone();
        assert_eq!(open[keys::RANDOMIZED_BUNDLE_TOKEN], json!("b1"));
    }

    #[test]
    fn second_init_reports_already_initialized() {
        let device = Arc::new(FakeDeviceSignals::default());
        let client = started(session_server(), device);

        let (tx, rx) = mpsc::channel();
        client.init_session(InitOptions::new().callback(move |params| {
            let _ = tx.send(params);
        }));

        let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, Err(crate::Error::AlreadyInitialized)));
    }

    #[test]
    fn instant_deep_link_answers_immediately() {
        let transport = session_server();
        let device = Arc::new(FakeDeviceSignals::default());
        let client = client_with(transport.clone(), device.clone());

        let (tx, rx) = mpsc::channel();
        client.init_session(
            InitOptions::new()
                .intent(LaunchIntent {
                    referring_params: Some(json!({"+instant": true})),
                    ..LaunchIntent::default()
                })
                .callback(move |params| {
                    let _ = tx.send(params);
                }),
        );

        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"+instant": true}));
        assert_eq!(transport.paths().len(), 0);

        device.complete(None);
        assert!(wait_until(|| client.session_state() == SessionState::Initialized));
        assert_eq!(
            transport.calls()[0].body[keys::INSTRUMENTATION][keys::INSTANT_DL_SESSION],
            json!("true")
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn short_urls_are_cached_until_logout() {
        let transport = session_server();
        let client = started(transport.clone(), Arc::new(FakeDeviceSignals::default()));
        let link = LinkProperties {
            channel: Some("sms".to_owned()),
            tags: vec!["promo".to_owned()],
            ..LinkProperties::default()
        };

        let create = |client: &Client| {
            let (tx, rx) = mpsc::channel();
            client.create_short_url(&link, move |url| {
                let _ = tx.send(url);
            });
            rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap()
        };

        assert_eq!(create(&client), "https://app.link/abc");
        assert_eq!(create(&client), "https://app.link/abc");
        assert_eq!(transport.paths().iter().filter(|it| *it == "v1/url").count(), 1);

        let (tx, rx) = mpsc::channel();
        client.logout(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        assert_eq!(create(&client), "https://app.link/abc");
        assert_eq!(transport.paths().iter().filter(|it| *it == "v1/url").count(), 2);
    }

    #[test]
    fn unchanged_identity_does_not_hit_the_network() {
        let transport = session_server();
        let client = started(transport.clone(), Arc::new(FakeDeviceSignals::default()));
        client.ctx.prefs.set(pref_keys::IDENTITY, Some("user-1"));

        let (tx, rx) = mpsc::channel();
        client.set_identity("user-1", move |params| {
            let _ = tx.send(params);
        });

        assert!(rx.try_recv().unwrap().is_ok());
        assert!(!transport.paths().contains(&"v1/profile".to_owned()));
    }

    #[test]
    fn events_carry_names_and_data() {
        let transport = session_server();
        let client = started(transport.clone(), Arc::new(FakeDeviceSignals::default()));
        client.set_request_metadata("campaign", "spring");

        let (tx, rx) = mpsc::channel();
        client.log_event(
            Event::standard("PURCHASE")
                .event_data("revenue", 9.99)
                .custom_data("color", "red"),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        let calls = transport.calls();
        let event = &calls.last().unwrap().body;
        assert_eq!(calls.last().unwrap().path, "v2/event/standard");
        assert_eq!(event[keys::NAME], json!("PURCHASE"));
        assert_eq!(event[keys::EVENT_DATA], json!({"revenue": 9.99}));
        assert_eq!(event[keys::CUSTOM_DATA], json!({"color": "red"}));
        assert_eq!(event[keys::SESSION_ID], json!("s1"));
        assert_eq!(event[keys::METADATA], json!({"campaign": "spring"}));
        assert_eq!(event[keys::USER_DATA]["os"], json!("TestOS"));
    }

    #[test]
    fn disabling_tracking_drops_session_data() {
        let client = started(session_server(), Arc::new(FakeDeviceSignals::default()));

        client.set_tracking_disabled(true);

        assert!(client.is_tracking_disabled());
        assert_eq!(client.session_state(), SessionState::Uninitialized);
        assert_eq!(client.latest_referring_params(), json!({}));
        assert_eq!(client.queue_len(), 0);

        let (tx, rx) = mpsc::channel();
        client.logout(move |outcome| {
            let _ = tx.send(outcome);
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(crate::Error::TrackingDisabled)
        ));
    }

    #[test]
    fn close_session_allows_a_new_session() {
        let transport = session_server();
        let device = Arc::new(FakeDeviceSignals::default());
        let client = started(transport.clone(), device.clone());

        client.close_session();
        assert_eq!(client.session_state(), SessionState::Uninitialized);
        assert!(wait_until(|| transport.paths().contains(&"v1/close".to_owned())));

        client.init_session(InitOptions::new());
        device.complete(None);
        assert!(wait_until(|| client.session_state() == SessionState::Initialized));
        assert_eq!(transport.paths().last().unwrap(), "v1/open");
    }

    #[test]
    fn shutdown_stops_processing() {
        let transport = session_server();
        let device = Arc::new(FakeDeviceSignals::default());
        let client = client_with(transport.clone(), device.clone());

        client.init_session(InitOptions::new());
        client.shutdown();
        device.complete(None);
        std::thread::sleep(Duration::from_millis(200));

        assert!(transport.paths().is_empty());
        assert_eq!(client.session_state(), SessionState::Uninitialized);
    }
}
