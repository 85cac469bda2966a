//! Bounded, persisted queue of requests with a single network slot.
//!
//! Only the head of the queue is ever considered for dispatch, and at most one request is in
//! flight at a time. The dispatch happens on a background thread; its completion releases the
//! network slot and advances the queue from that same thread.
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use serde_json::Value;

use crate::{
    context::Context,
    request::{
        fail_unqueued, keys, Payload, PayloadSources, PersistedRequest, Request, RequestCallback,
        RequestId, RequestPath,
    },
    session::SessionState,
    storage::pref_keys,
    timer::jitter,
    transport::ServerResponse,
    wait_lock::WaitLock,
    Error,
};

/// Maximum number of queued requests.
pub const MAX_ITEMS: usize = 25;

/// Counting guard limiting the number of concurrent network calls.
#[derive(Debug)]
pub(crate) struct NetworkSlot {
    in_flight: AtomicUsize,
    capacity: usize,
}

impl NetworkSlot {
    pub fn new(capacity: usize) -> NetworkSlot {
        NetworkSlot {
            in_flight: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }
}

/// Snapshot of a queued request, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub path: RequestPath,
    pub payload: Payload,
    pub locks: Vec<WaitLock>,
    pub retry_count: u32,
    pub initiated_by_client: bool,
}

impl From<&Request> for QueuedRequest {
    fn from(request: &Request) -> Self {
        let mut locks: Vec<WaitLock> = request.locks().iter().collect();
        locks.sort();
        QueuedRequest {
            id: request.id(),
            path: request.path(),
            payload: request.payload().clone(),
            locks,
            retry_count: request.retry_count(),
            initiated_by_client: request.is_initiated_by_client(),
        }
    }
}

/// The request queue of one client. Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<Context>,
    requests: Mutex<VecDeque<Request>>,
    slot: NetworkSlot,
    in_flight: Mutex<Option<RequestId>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.len())
            .field("in_flight", &self.inner.slot.is_busy())
            .finish()
    }
}

impl RequestQueue {
    /// Create the queue, restoring persisted requests.
    pub(crate) fn new(ctx: Arc<Context>) -> RequestQueue {
        let requests = restore(&ctx);
        if !requests.is_empty() {
            log::debug!(target: "attribution", count = requests.len(); "restored persisted requests");
        }
        RequestQueue {
            inner: Arc::new(Inner {
                ctx,
                requests: Mutex::new(requests),
                slot: NetworkSlot::new(1),
                in_flight: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Request>> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<RequestId>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, requests: &VecDeque<Request>) {
        let entries: Vec<PersistedRequest> =
            requests.iter().filter_map(Request::to_persisted).collect();
        let result = serde_json::to_string(&entries)
            .map_err(Error::from)
            .and_then(|raw| {
                self.inner
                    .ctx
                    .prefs
                    .store()
                    .set_string(pref_keys::REQUEST_QUEUE, &raw)
            });
        if let Err(err) = result {
            log::error!(target: "attribution", "failed to persist request queue: {err}");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn peek_at(&self, index: usize) -> Option<QueuedRequest> {
        self.lock().get(index).map(QueuedRequest::from)
    }

    /// Snapshot of the whole queue, head first.
    pub fn snapshot(&self) -> Vec<QueuedRequest> {
        self.lock().iter().map(QueuedRequest::from).collect()
    }

    /// Whether a network call is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.slot.is_busy()
    }

    /// Append `request`. When the queue overflows, the request right behind the head is evicted.
    pub(crate) fn enqueue(&self, mut request: Request) {
        request.mark_queued();
        let evicted = {
            let mut requests = self.lock();
            requests.push_back(request);
            let evicted = if requests.len() > MAX_ITEMS {
                requests.remove(1)
            } else {
                None
            };
            self.persist(&requests);
            evicted
        };
        if let Some(evicted) = evicted {
            fail_evicted(evicted);
        }
    }

    /// Insert `request` at the head, or right behind the in-flight request.
    pub(crate) fn insert_at_front(&self, mut request: Request) {
        request.mark_queued();
        let evicted = {
            let mut requests = self.lock();
            let in_flight = *self.in_flight();
            let index = match (requests.front(), in_flight) {
                (Some(head), Some(id)) if head.id() == id => 1,
                _ => 0,
            };
            requests.insert(index, request);
            let evicted = if requests.len() > MAX_ITEMS {
                requests.remove(index + 1)
            } else {
                None
            };
            self.persist(&requests);
            evicted
        };
        if let Some(evicted) = evicted {
            fail_evicted(evicted);
        }
    }

    /// Remove a request without completing it.
    pub(crate) fn remove(&self, id: RequestId) -> Option<Request> {
        let mut requests = self.lock();
        let index = requests.iter().position(|it| it.id() == id)?;
        let request = requests.remove(index);
        self.persist(&requests);
        request
    }

    /// Drop every queued request. Their callbacks are not invoked.
    pub fn clear(&self) {
        let dropped = {
            let mut requests = self.lock();
            let dropped = std::mem::take(&mut *requests);
            self.persist(&requests);
            dropped
        };
        log::debug!(target: "attribution", count = dropped.len(); "cleared request queue");
    }

    /// Remove `lock` from every queued request. Returns whether any request held it.
    pub fn unlock_wait(&self, lock: WaitLock) -> bool {
        let mut requests = self.lock();
        let mut removed = false;
        for request in requests.iter_mut() {
            removed |= request.remove_lock(lock);
        }
        if removed {
            log::debug!(target: "attribution", lock = lock.as_str(); "released wait lock");
        }
        removed
    }

    /// Remove `lock` from one request. Returns whether the request held it.
    pub(crate) fn unlock_request(&self, id: RequestId, lock: WaitLock) -> bool {
        self.lock()
            .iter_mut()
            .find(|it| it.id() == id)
            .map(|request| request.remove_lock(lock))
            .unwrap_or(false)
    }

    pub(crate) fn add_lock(&self, id: RequestId, lock: WaitLock) -> bool {
        match self.lock().iter_mut().find(|it| it.id() == id) {
            Some(request) => {
                request.add_lock(lock);
                true
            }
            None => false,
        }
    }

    /// Clear the retry deferral of a queued request.
    fn resume(&self, id: RequestId) {
        if let Some(request) = self.lock().iter_mut().find(|it| it.id() == id) {
            request.resume();
        }
    }

    /// Mutate the payload of a queued request. Returns `false` if the request is gone.
    pub(crate) fn update_payload(&self, id: RequestId, f: impl FnOnce(&mut Payload)) -> bool {
        let mut requests = self.lock();
        let Some(request) = requests.iter_mut().find(|it| it.id() == id) else {
            return false;
        };
        f(request.payload_mut());
        self.persist(&requests);
        true
    }

    pub fn contains_init_request(&self) -> bool {
        self.lock().iter().any(|it| it.path().is_session_init())
    }

    /// Id of a queued session-init request the client initiated explicitly.
    pub(crate) fn self_init_request_id(&self) -> Option<RequestId> {
        self.lock()
            .iter()
            .find(|it| it.path().is_session_init() && it.is_initiated_by_client())
            .map(Request::id)
    }

    /// Move `callback` onto request `id`, dropping its previous callback. Gives the callback
    /// back if the request is no longer queued.
    pub(crate) fn transplant_callback(
        &self,
        id: RequestId,
        callback: RequestCallback,
    ) -> std::result::Result<(), RequestCallback> {
        match self.lock().iter_mut().find(|it| it.id() == id) {
            Some(request) => {
                request.replace_callback(Some(callback));
                Ok(())
            }
            None => Err(callback),
        }
    }

    /// Record an instrumentation value sent with the next dispatched request.
    pub fn add_instrumentation_data(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.ctx.add_instrumentation(key, value);
    }

    /// Admit a new request.
    pub fn handle_new_request(&self, mut request: Request) {
        let ctx = &self.inner.ctx;
        if ctx.is_tracking_disabled() && !request.prepare_execute_without_tracking() {
            fail_unqueued(request, Error::TrackingDisabled);
            return;
        }
        if let Some(reason) = request.construction_error().map(str::to_owned) {
            fail_unqueued(request, Error::InvalidRequest(reason));
            return;
        }
        if ctx.state() != SessionState::Initialized && request.path().needs_session() {
            request.add_lock(WaitLock::SdkInit);
        }
        log::debug!(target: "attribution",
                    request_id:% = request.id(),
                    path = request.path().as_str();
                    "queueing request");
        self.enqueue(request);
        self.process_next("new request");
    }

    /// Put a session-init request at the front and try to dispatch.
    pub fn insert_request_at_front(&self, request: Request) {
        self.insert_at_front(request);
        self.process_next("request inserted at front");
    }

    /// Dispatch the head of the queue if it is eligible and the network is free.
    pub fn process_next(&self, reason: &str) {
        let ctx = &self.inner.ctx;
        loop {
            if self.inner.shut_down.load(Ordering::Acquire) {
                return;
            }
            if !self.inner.slot.try_acquire() {
                log::trace!(target: "attribution", reason; "network busy");
                return;
            }

            let mut requests = self.lock();
            let Some((id, path, waiting, construction_error)) = requests.front().map(|head| {
                (
                    head.id(),
                    head.path(),
                    head.is_blocked() || head.is_deferred(),
                    head.construction_error().map(str::to_owned),
                )
            }) else {
                drop(requests);
                self.inner.slot.release();
                return;
            };

            if waiting {
                log::debug!(target: "attribution", request_id:% = id, path = path.as_str(), reason; "head of queue is waiting");
                drop(requests);
                self.inner.slot.release();
                return;
            }

            let failure = if let Some(reason) = construction_error {
                Some(Error::InvalidRequest(reason))
            } else if path.needs_session() && !ctx.prefs.has_session() {
                Some(Error::NoSession)
            } else {
                None
            };
            if let Some(error) = failure {
                let request = requests.pop_front();
                self.persist(&requests);
                drop(requests);
                self.inner.slot.release();
                if let Some(mut request) = request {
                    log::warn!(target: "attribution", request_id:% = id, path = path.as_str(), code = error.code(); "request failed before dispatch");
                    request.complete(Err(error));
                }
                continue;
            }

            let (device_info, advertising_id) = if ctx.is_tracking_disabled() {
                (Payload::new(), None)
            } else {
                (ctx.device_info(), ctx.advertising_id())
            };
            let partner_params = ctx.partner_params();
            let metadata = ctx.metadata();
            let body = requests[0].build_outgoing(PayloadSources {
                device_info: &device_info,
                partner_params: &partner_params,
                metadata: &metadata,
                instrumentation: ctx.drain_instrumentation(),
                advertising_id: advertising_id.as_ref(),
            });
            *self.in_flight() = Some(id);
            drop(requests);

            log::debug!(target: "attribution", request_id:% = id, path = path.as_str(), reason; "dispatching request");
            self.dispatch(id, path, body);
            return;
        }
    }

    fn dispatch(&self, id: RequestId, path: RequestPath, body: Payload) {
        let queue = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("attribution-request-{id}"))
            .spawn(move || {
                let response = queue.execute(id, path, body);
                let handled = catch_unwind(AssertUnwindSafe(|| {
                    queue.handle_response(id, path, response)
                }));
                if handled.is_err() {
                    log::error!(target: "attribution", request_id:% = id; "panic while handling response");
                }
                *queue.in_flight() = None;
                queue.inner.slot.release();
                queue.process_next("request completed");
            });
        if let Err(err) = spawned {
            log::error!(target: "attribution", request_id:% = id; "failed to spawn dispatch thread: {err}");
            *self.in_flight() = None;
            self.inner.slot.release();
            if let Some(mut request) = self.remove(id) {
                request.complete(Err(err.into()));
            }
        }
    }

    /// Run the transport on its own thread, giving up after the task timeout.
    fn execute(&self, id: RequestId, path: RequestPath, body: Payload) -> ServerResponse {
        let settings = &self.inner.ctx.settings;
        let url = match settings.base_url.join(path.as_str()) {
            Ok(url) => url,
            Err(err) => return ServerResponse::error(400, format!("invalid request url: {err}")),
        };

        let (sender, receiver) = mpsc::sync_channel(1);
        let transport = self.inner.ctx.transport.clone();
        let app_key = settings.app_key.clone();
        let read_timeout = settings.read_timeout;
        let spawned = std::thread::Builder::new()
            .name(format!("attribution-transport-{id}"))
            .spawn(move || {
                let response = catch_unwind(AssertUnwindSafe(|| {
                    if path.is_get() {
                        transport.get(&url, &body, &app_key, read_timeout)
                    } else {
                        transport.post(&url, &body, &app_key, read_timeout)
                    }
                }))
                .unwrap_or_else(|_| ServerResponse::error(500, "transport panicked"));
                // The receiver is gone if the task already timed out.
                let _ = sender.send(response);
            });
        if let Err(err) = spawned {
            return ServerResponse::error(Error::ERR_NO_CONNECTIVITY, err.to_string());
        }

        match receiver.recv_timeout(settings.task_timeout()) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(target: "attribution", request_id:% = id, path = path.as_str(); "request timed out");
                ServerResponse::timed_out()
            }
            Err(RecvTimeoutError::Disconnected) => {
                ServerResponse::error(500, "transport exited without a response")
            }
        }
    }

    fn handle_response(&self, id: RequestId, path: RequestPath, response: ServerResponse) {
        let ctx = &self.inner.ctx;
        let status = match (&response.body, response.status_code) {
            (None, status) if (200..300).contains(&status) => 500,
            (_, status) => status,
        };
        log::debug!(target: "attribution", request_id:% = id, path = path.as_str(), status; "request completed");

        if (200..300).contains(&status) {
            let Some(mut request) = self.remove(id) else {
                log::debug!(target: "attribution", request_id:% = id; "completed request is no longer queued");
                return;
            };
            let body = response.body.unwrap_or(Value::Null);
            log::trace!(target: "attribution", request_id:% = id, body:serde; "response body");
            match catch_unwind(AssertUnwindSafe(|| self.on_success(&request, &body))) {
                Ok(()) => request.complete(Ok(body)),
                Err(_) => {
                    log::error!(target: "attribution", request_id:% = id; "panic while processing response");
                    request.complete(Err(Error::InvalidRequest(
                        "failed to process server response".to_owned(),
                    )));
                }
            }
            return;
        }

        if path.is_session_init() {
            if ctx.state() == SessionState::Initializing
                && ctx.prefs.get(pref_keys::SESSION_PARAMS).is_none()
            {
                ctx.session.transition(SessionState::Uninitialized);
            }
            ctx.referring_params_latch.count_down();
        }

        let error = if path == RequestPath::GetUrl && (status == 400 || status == 409) {
            Error::DuplicateUrl
        } else {
            Error::from_status(status, response.reason())
        };

        if path.should_retry_on_fail() && !Error::is_non_retryable_status(status) {
            let mut requests = self.lock();
            if let Some(request) = requests.iter_mut().find(|it| it.id() == id) {
                if request.retry_count() < ctx.settings.max_retries {
                    let attempt = request.increment_retry_count();
                    let delay = jitter(ctx.settings.retry_interval, ctx.settings.retry_jitter);
                    request.defer_until(Instant::now() + delay);
                    drop(requests);
                    log::warn!(target: "attribution",
                               request_id:% = id,
                               path = path.as_str(),
                               status,
                               attempt;
                               "request failed, retrying");
                    let queue = self.clone();
                    let retry = move || {
                        queue.resume(id);
                        queue.process_next("retry");
                    };
                    if let Err(err) = ctx.timers.schedule("retry", delay, retry) {
                        log::error!(target: "attribution", "failed to schedule retry, retrying now: {err}");
                        self.resume(id);
                    }
                    return;
                }
            }
        }

        if let Some(mut request) = self.remove(id) {
            log::warn!(target: "attribution", request_id:% = id, path = path.as_str(), code = error.code(); "request failed: {error}");
            request.complete(Err(error));
        }
    }

    fn on_success(&self, request: &Request, body: &Value) {
        let ctx = &self.inner.ctx;
        let path = request.path();
        match path {
            RequestPath::GetUrl => {
                if let Some(url) = body.get(keys::URL).and_then(Value::as_str) {
                    ctx.link_cache.put(request.payload(), url);
                }
            }
            RequestPath::Logout => {
                ctx.link_cache.clear();
                self.clear();
                ctx.prefs.set(pref_keys::IDENTITY, None);
                ctx.store_params(pref_keys::SESSION_PARAMS, None);
                ctx.store_params(pref_keys::INSTALL_PARAMS, None);
                ctx.session.reset();
            }
            RequestPath::IdentifyUser => {
                if let Some(identity) = request.payload().get(keys::IDENTITY).and_then(Value::as_str)
                {
                    ctx.prefs.set(pref_keys::IDENTITY, Some(identity));
                }
                if let Some(data) = body.get(keys::DATA).filter(|it| !it.is_null()) {
                    ctx.store_params(pref_keys::INSTALL_PARAMS, Some(data));
                }
            }
            _ => {}
        }

        if path.is_session_init() || matches!(path, RequestPath::IdentifyUser | RequestPath::Logout)
        {
            if self.commit_tokens(body) {
                self.propagate_tokens();
            }
        }

        if path.is_session_init() {
            let data = body.get(keys::DATA).filter(|it| !it.is_null());
            ctx.store_params(pref_keys::SESSION_PARAMS, data);
            if path == RequestPath::RegisterInstall && data.is_some() {
                ctx.store_params(pref_keys::INSTALL_PARAMS, data);
            }
            ctx.prefs.post_init_clear();
            if ctx.state() == SessionState::Uninitialized {
                ctx.session.transition(SessionState::Initializing);
            }
            ctx.session.transition(SessionState::Initialized);
            ctx.referring_params_latch.count_down();
            self.unlock_wait(WaitLock::SdkInit);
        }
    }

    /// Store session tokens from a response body. Returns whether any token changed.
    pub(crate) fn commit_tokens(&self, body: &Value) -> bool {
        let ctx = &self.inner.ctx;
        if ctx.is_tracking_disabled() {
            return false;
        }
        let text = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .filter(|it| !it.is_empty())
                .map(str::to_owned)
        };

        let mut changed = false;
        if let Some(session_id) = text(keys::SESSION_ID) {
            if ctx.prefs.session_id().as_deref() != Some(session_id.as_str()) {
                ctx.prefs.set(pref_keys::SESSION_ID, Some(&session_id));
                changed = true;
            }
        }
        if let Some(token) = text(keys::RANDOMIZED_BUNDLE_TOKEN) {
            if ctx.prefs.randomized_bundle_token().as_deref() != Some(token.as_str()) {
                ctx.link_cache.clear();
                ctx.prefs
                    .set(pref_keys::RANDOMIZED_BUNDLE_TOKEN, Some(&token));
                changed = true;
            }
        }
        if let Some(token) = text(keys::RANDOMIZED_DEVICE_TOKEN) {
            if ctx.prefs.randomized_device_token().as_deref() != Some(token.as_str()) {
                ctx.prefs
                    .set(pref_keys::RANDOMIZED_DEVICE_TOKEN, Some(&token));
                changed = true;
            }
        }
        if let Some(identity_id) = text(keys::IDENTITY_ID) {
            ctx.prefs.set(pref_keys::IDENTITY_ID, Some(&identity_id));
        }
        if let Some(link) = text(keys::LINK) {
            ctx.prefs.set(pref_keys::USER_URL, Some(&link));
        }
        changed
    }

    /// Rewrite session tokens in every queued request that already carries them.
    pub(crate) fn propagate_tokens(&self) {
        let prefs = &self.inner.ctx.prefs;
        let tokens = [
            (keys::SESSION_ID, prefs.session_id()),
            (keys::RANDOMIZED_DEVICE_TOKEN, prefs.randomized_device_token()),
            (keys::RANDOMIZED_BUNDLE_TOKEN, prefs.randomized_bundle_token()),
        ];
        let mut requests = self.lock();
        let mut changed = false;
        for request in requests.iter_mut() {
            for (key, value) in &tokens {
                if let Some(value) = value {
                    changed |= request.rewrite_if_present(key, value);
                }
            }
        }
        if changed {
            self.persist(&requests);
        }
    }

    /// Stop dispatching and drop every queued request.
    pub(crate) fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.clear();
    }
}

fn fail_evicted(mut request: Request) {
    log::warn!(target: "attribution", request_id:% = request.id(), path = request.path().as_str(); "request queue is full, evicting request");
    request.complete(Err(Error::InvalidRequest(
        "request queue is full".to_owned(),
    )));
}

fn restore(ctx: &Context) -> VecDeque<Request> {
    let Some(raw) = ctx.prefs.get(pref_keys::REQUEST_QUEUE) else {
        return VecDeque::new();
    };
    let entries: Vec<Value> = match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!(target: "attribution", "discarding unreadable persisted queue: {err}");
            return VecDeque::new();
        }
    };
    entries
        .into_iter()
        .take(MAX_ITEMS)
        .filter_map(|entry| serde_json::from_value::<PersistedRequest>(entry).ok())
        .filter_map(Request::from_persisted)
        .map(|mut request| {
            if request.path().needs_session() {
                request.add_lock(WaitLock::SdkInit);
            }
            request.mark_queued();
            request
        })
        .collect()
}
