//! Session initialization state machine.
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

use crate::storage::Preferences;

/// Initialization state of the SDK session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Initialized,
}

impl SessionState {
    fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (from, to),
            (Uninitialized, Initializing)
                | (Initializing, Initialized)
                | (Initializing, Uninitialized)
                | (Initialized, Initializing)
        )
    }

    fn to_u8(self) -> u8 {
        match self {
            SessionState::Uninitialized => 0,
            SessionState::Initializing => 1,
            SessionState::Initialized => 2,
        }
    }

    fn from_u8(value: u8) -> SessionState {
        match value {
            1 => SessionState::Initializing,
            2 => SessionState::Initialized,
            _ => SessionState::Uninitialized,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Initialized => "initialized",
        })
    }
}

/// Receives session state changes.
///
/// Observers run after the transition lock is released, in the order the transitions happened.
/// An observer may trigger further transitions; those are delivered once it returns.
pub trait SessionStateObserver {
    fn on_state_changed(&self, previous: SessionState, current: SessionState);
}

impl<T: Fn(SessionState, SessionState)> SessionStateObserver for T {
    fn on_state_changed(&self, previous: SessionState, current: SessionState) {
        self(previous, current);
    }
}

/// Handle returned by [`SessionStateManager::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From)]
pub struct ObserverId(u64);

type SharedObserver = Arc<dyn SessionStateObserver + Send + Sync>;

/// Owns the [`SessionState`] and notifies observers about transitions.
pub struct SessionStateManager {
    state: RwLock<SessionState>,
    transition: Mutex<()>,
    // Transitions not yet delivered to observers, oldest first.
    pending: Mutex<VecDeque<(SessionState, SessionState)>>,
    delivering: AtomicBool,
    observers: RwLock<Vec<(ObserverId, SharedObserver)>>,
    next_observer_id: AtomicU64,
    prefs: Preferences,
}

impl std::fmt::Debug for SessionStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateManager")
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl SessionStateManager {
    pub fn new(prefs: Preferences) -> SessionStateManager {
        SessionStateManager {
            state: RwLock::new(SessionState::Uninitialized),
            transition: Mutex::new(()),
            pending: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            prefs,
        }
    }

    pub fn current_state(&self) -> SessionState {
        *self
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `true` only once the session is fully initialized.
    pub fn can_perform_operations(&self) -> bool {
        self.current_state() == SessionState::Initialized
    }

    /// Returns `true` if the session is initialized and a session id has been issued.
    pub fn has_active_session(&self) -> bool {
        self.can_perform_operations() && self.prefs.session_id().is_some()
    }

    /// Move to `to`. Returns `false` and leaves the state untouched if the transition is not
    /// allowed.
    pub fn transition(&self, to: SessionState) -> bool {
        {
            let _guard = self
                .transition
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let from = self.current_state();
            if !SessionState::is_valid_transition(from, to) {
                log::warn!(target: "attribution", from:% = from, to:% = to; "rejected invalid session state transition");
                return false;
            }
            self.set(from, to);
        }
        self.deliver();
        true
    }

    /// Unconditionally return to [`SessionState::Uninitialized`].
    pub fn reset(&self) {
        {
            let _guard = self
                .transition
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let from = self.current_state();
            if from != SessionState::Uninitialized {
                self.set(from, SessionState::Uninitialized);
            }
        }
        self.deliver();
    }

    fn set(&self, from: SessionState, to: SessionState) {
        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = to;
        log::debug!(target: "attribution", from:% = from, to:% = to; "session state changed");
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back((from, to));
    }

    /// Drain pending transitions to observers. Only one caller delivers at a time; transitions
    /// queued meanwhile (including by observers) are picked up by that caller.
    fn deliver(&self) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .pop_front();
                let Some((previous, current)) = next else {
                    break;
                };
                self.notify(previous, current);
            }
            self.delivering.store(false, Ordering::Release);
            let empty = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_empty();
            if empty {
                return;
            }
        }
    }

    fn notify(&self, previous: SessionState, current: SessionState) {
        let observers: Vec<SharedObserver> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                observer.on_state_changed(previous, current)
            }));
            if result.is_err() {
                log::warn!(target: "attribution", "session state observer panicked");
            }
        }
    }

    pub fn add_observer(
        &self,
        observer: impl SessionStateObserver + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` if no observer was registered under `id`.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(it, _)| *it != id);
        observers.len() != before
    }
}

/// Session state manager paired with a lock-free three-state mirror.
///
/// Every update goes to the manager first. If the manager panics, the mirror receives the value
/// instead and reads consult it from then on.
#[derive(Debug)]
pub(crate) struct TrackedSession {
    manager: SessionStateManager,
    mirror: AtomicU8,
    degraded: AtomicBool,
}

impl TrackedSession {
    pub fn new(manager: SessionStateManager) -> TrackedSession {
        TrackedSession {
            manager,
            mirror: AtomicU8::new(SessionState::Uninitialized.to_u8()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &SessionStateManager {
        &self.manager
    }

    pub fn state(&self) -> SessionState {
        if self.degraded.load(Ordering::Acquire) {
            return SessionState::from_u8(self.mirror.load(Ordering::Acquire));
        }
        self.manager.current_state()
    }

    pub fn transition(&self, to: SessionState) -> bool {
        self.update(to, |manager| manager.transition(to))
    }

    pub fn reset(&self) {
        self.update(SessionState::Uninitialized, |manager| {
            manager.reset();
            true
        });
    }

    fn update(&self, to: SessionState, f: impl FnOnce(&SessionStateManager) -> bool) -> bool {
        match catch_unwind(AssertUnwindSafe(|| f(&self.manager))) {
            Ok(changed) => {
                self.mirror
                    .store(self.manager.current_state().to_u8(), Ordering::Release);
                changed
            }
            Err(_) => {
                log::error!(target: "attribution", to:% = to; "session state manager panicked, using fallback state");
                self.mirror.store(to.to_u8(), Ordering::Release);
                self.degraded.store(true, Ordering::Release);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{SessionState, SessionStateManager};
    use crate::storage::{pref_keys, MemoryStore, Preferences};

    fn manager() -> (SessionStateManager, Preferences) {
        let prefs = Preferences::new(Arc::new(MemoryStore::new()));
        (SessionStateManager::new(prefs.clone()), prefs)
    }

    #[test]
    fn follows_the_allowed_transitions() {
        let (manager, _) = manager();

        assert!(!manager.transition(SessionState::Initialized));
        assert!(manager.transition(SessionState::Initializing));
        assert!(manager.transition(SessionState::Initialized));
        assert!(manager.can_perform_operations());
        assert!(!manager.transition(SessionState::Uninitialized));
        assert!(manager.transition(SessionState::Initializing));
        assert!(!manager.can_perform_operations());
    }

    #[test]
    fn active_session_needs_session_id() {
        let (manager, prefs) = manager();
        manager.transition(SessionState::Initializing);
        manager.transition(SessionState::Initialized);
        assert!(!manager.has_active_session());

        prefs.set(pref_keys::SESSION_ID, Some("s1"));
        assert!(manager.has_active_session());
    }

    #[test]
    fn observer_can_trigger_a_transition() {
        let manager = Arc::new(manager().0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        manager.add_observer({
            let manager = Arc::downgrade(&manager);
            let seen = seen.clone();
            move |previous, current| {
                seen.lock().unwrap().push((previous, current));
                if current == SessionState::Initialized {
                    if let Some(manager) = manager.upgrade() {
                        manager.reset();
                    }
                }
            }
        });

        manager.transition(SessionState::Initializing);
        manager.transition(SessionState::Initialized);

        assert_eq!(manager.current_state(), SessionState::Uninitialized);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SessionState::Uninitialized, SessionState::Initializing),
                (SessionState::Initializing, SessionState::Initialized),
                (SessionState::Initialized, SessionState::Uninitialized),
            ]
        );
    }

    #[test]
    fn observers_see_transitions_in_order() {
        let (manager, _) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        manager.add_observer(|_, _| panic!("misbehaving observer"));
        let id = manager.add_observer({
            let seen = seen.clone();
            move |previous, current| seen.lock().unwrap().push((previous, current))
        });

        manager.transition(SessionState::Initializing);
        manager.transition(SessionState::Initialized);
        manager.reset();
        assert!(manager.remove_observer(id));
        assert!(!manager.remove_observer(id));
        manager.transition(SessionState::Initializing);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (SessionState::Uninitialized, SessionState::Initializing),
                (SessionState::Initializing, SessionState::Initialized),
                (SessionState::Initialized, SessionState::Uninitialized),
            ]
        );
    }
}
