//! Request queue and session state machine of a mobile attribution SDK.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that talks to the attribution server. Every API call
//! becomes a [`Request`] that is queued, gated on the session state, and sent one at a time. A
//! session is established by an install or open request which may wait on device collaborators
//! (advertising ID, install referrer, the launch intent) before it is sent. Requests that need a
//! session wait for it; failed requests are retried or reported through their callback.
//!
//! Collaborators are injected through [`ClientConfig`]: a [`KeyValueStore`] for persistence, a
//! [`Transport`] for HTTP, [`DeviceSignals`] and [`InstallReferrerProvider`]s.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Each variant has a stable numeric code
//! ([`Error::code`]) matching the codes reported to apps.
//!
//! Request outcomes are delivered to callbacks exactly once. Transient failures that are retried
//! are not reported.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `attribution` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into queue and session transitions.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]

mod bootstrap;
mod client;
mod config;
mod context;
mod device;
mod error;
mod latch;
mod link_cache;
mod queue;
mod request;
mod session;
mod storage;
mod timer;
mod transport;
mod wait_lock;

#[cfg(test)]
mod test_support;

pub use bootstrap::{InitOptions, LaunchIntent};
pub use client::{Client, Event, LinkProperties};
pub use config::{validate_app_key, ClientConfig};
pub use device::{
    select_referrer_provider, AdvertisingId, AdvertisingIdCallback, DeviceSignals, InstallReferrer,
    InstallReferrerCallback, InstallReferrerProvider, NoDeviceSignals, NoInstallReferrer,
    SharedDeviceSignals, SharedReferrerProvider,
};
pub use error::{Error, Result};
pub use queue::{QueuedRequest, RequestQueue, MAX_ITEMS};
pub use request::{keys, Payload, PersistedRequest, Request, RequestCallback, RequestId, RequestPath};
pub use session::{ObserverId, SessionState, SessionStateManager, SessionStateObserver};
pub use storage::{
    pref_keys, FileStore, KeyValueStore, MemoryStore, Preferences, SharedStore, StoredValue,
    NO_STRING_VALUE,
};
pub use transport::{HttpTransport, ServerResponse, SharedTransport, Transport};
pub use wait_lock::{WaitLock, WaitLocks};
