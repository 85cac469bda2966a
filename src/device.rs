//! Device and OS signals consumed by the core.
//!
//! Collection itself happens outside of this crate. Each asynchronous fetch exposes a single
//! completion callback; the core uses it to clear the corresponding [`WaitLock`].
//!
//! [`WaitLock`]: crate::WaitLock
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::request::Payload;

/// Advertising identifier together with the limited-ad-tracking flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingId {
    /// The advertising identifier. Empty when unavailable.
    pub id: String,
    /// Whether the user opted out of ad personalization.
    pub limit_ad_tracking: bool,
}

/// Install referrer reported by an app store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReferrer {
    /// Name of the store that reported the referrer.
    pub store: String,
    /// Raw referrer string.
    pub referrer: String,
    /// Referrer click timestamp, seconds since the epoch.
    pub click_timestamp: i64,
    /// Install begin timestamp, seconds since the epoch.
    pub install_begin_timestamp: i64,
}

/// Completion callback of an advertising ID fetch. `None` means unavailable.
pub type AdvertisingIdCallback = Box<dyn FnOnce(Option<AdvertisingId>) + Send + 'static>;

/// Completion callback of an install referrer fetch. `None` means unavailable.
pub type InstallReferrerCallback = Box<dyn FnOnce(Option<InstallReferrer>) + Send + 'static>;

/// Device signal provider.
pub trait DeviceSignals {
    /// Start fetching the advertising ID. `done` must be invoked at most once, from any thread.
    /// If it is never invoked, the watchdog releases the wait lock.
    fn fetch_advertising_id(&self, done: AdvertisingIdCallback);

    /// User agent string, if known.
    fn user_agent(&self) -> Option<String>;

    /// Static device information merged into every outgoing payload.
    fn device_info(&self) -> Payload;
}

/// Shared handle to a device signal provider.
pub type SharedDeviceSignals = Arc<dyn DeviceSignals + Send + Sync>;

/// Device signals that never resolve anything. Useful for hosts without an advertising ID.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeviceSignals;

impl DeviceSignals for NoDeviceSignals {
    fn fetch_advertising_id(&self, done: AdvertisingIdCallback) {
        done(None);
    }

    fn user_agent(&self) -> Option<String> {
        None
    }

    fn device_info(&self) -> Payload {
        Payload::new()
    }
}

/// A source of install referrer data, typically one per app store.
pub trait InstallReferrerProvider {
    /// Store name used in logs.
    fn name(&self) -> &str;

    /// Capability probe: whether this provider can run on the current device.
    fn is_available(&self) -> bool;

    /// Start fetching the referrer. `done` must be invoked at most once, from any thread.
    fn fetch(&self, done: InstallReferrerCallback);
}

/// Shared handle to a referrer provider.
pub type SharedReferrerProvider = Arc<dyn InstallReferrerProvider + Send + Sync>;

/// Provider for stores that expose no referrer. Always available, always answers `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInstallReferrer;

impl InstallReferrerProvider for NoInstallReferrer {
    fn name(&self) -> &str {
        "none"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn fetch(&self, done: InstallReferrerCallback) {
        done(None)
    }
}

/// Pick the first provider whose capability probe succeeds.
pub fn select_referrer_provider(
    providers: &[SharedReferrerProvider],
) -> Option<SharedReferrerProvider> {
    let selected = providers.iter().find(|it| it.is_available()).cloned();
    match &selected {
        Some(provider) => {
            log::debug!(target: "attribution", store = provider.name(); "selected install referrer provider")
        }
        None => log::debug!(target: "attribution", "no install referrer provider available"),
    }
    selected
}
