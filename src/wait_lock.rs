//! Named preconditions that must clear before a queued request may execute.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A named precondition attached to a [`Request`](crate::Request).
///
/// Locks are removed asynchronously by whichever collaborator completes the corresponding
/// precondition, or by the watchdog timer when the collaborator never calls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitLock {
    /// Waiting for a session to be established.
    SdkInit,
    /// Waiting for the advertising ID fetch to complete.
    AdvertisingIdFetch,
    /// Waiting for the launch intent to become available.
    IntentPending,
    /// Waiting for a user-requested initialization delay to expire.
    UserSetDelay,
    /// Waiting for the install referrer fetch to complete.
    InstallReferrerFetch,
    /// Waiting for the user agent string to be resolved.
    UserAgent,
}

impl WaitLock {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitLock::SdkInit => "sdk_init",
            WaitLock::AdvertisingIdFetch => "advertising_id_fetch",
            WaitLock::IntentPending => "intent_pending",
            WaitLock::UserSetDelay => "user_set_delay",
            WaitLock::InstallReferrerFetch => "install_referrer_fetch",
            WaitLock::UserAgent => "user_agent",
        }
    }
}

impl std::fmt::Display for WaitLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of wait locks held by a single request.
///
/// There is no ordering between lock removals. The owning request becomes eligible the moment
/// the set is empty; the queue notices lazily the next time it tries to dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitLocks {
    locks: HashSet<WaitLock>,
}

impl WaitLocks {
    /// Create an empty lock set.
    pub fn new() -> WaitLocks {
        WaitLocks::default()
    }

    /// Attach `lock`. Adding a lock that is already held is a no-op.
    pub fn add(&mut self, lock: WaitLock) {
        self.locks.insert(lock);
    }

    /// Detach `lock`, returning whether it was held. Removing an absent lock is a no-op.
    pub fn remove(&mut self, lock: WaitLock) -> bool {
        self.locks.remove(&lock)
    }

    /// Returns `true` iff at least one lock is held.
    pub fn is_blocked(&self) -> bool {
        !self.locks.is_empty()
    }

    /// Returns `true` if `lock` is held.
    pub fn contains(&self, lock: WaitLock) -> bool {
        self.locks.contains(&lock)
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns `true` if no lock is held.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Iterate over held locks in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = WaitLock> + '_ {
        self.locks.iter().copied()
    }
}
