use std::{sync::Arc, sync::OnceLock, time::Duration};

use regex::Regex;
use url::Url;

use crate::{
    device::{NoDeviceSignals, SharedDeviceSignals, SharedReferrerProvider},
    storage::{MemoryStore, SharedStore},
    transport::{HttpTransport, SharedTransport},
    Client, Error, Result,
};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) app_key: String,
    pub(crate) base_url: String,
    pub(crate) read_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_interval: Duration,
    pub(crate) retry_jitter: Duration,
    pub(crate) collaborator_max_wait: Duration,
    pub(crate) store: Option<SharedStore>,
    pub(crate) transport: Option<SharedTransport>,
    pub(crate) device_signals: SharedDeviceSignals,
    pub(crate) referrer_providers: Vec<SharedReferrerProvider>,
}

impl ClientConfig {
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://api2.branch.io/";
    /// Default time to wait for a response once connected.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(5500);
    /// Default time to wait for a connection.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
    /// Default number of retries for requests that retry on failure.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default pause between retries.
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);
    /// Default random jitter added to the retry interval.
    pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(100);
    /// Default time a request waits for a device collaborator before proceeding without it.
    pub const DEFAULT_COLLABORATOR_MAX_WAIT: Duration = Duration::from_millis(1500);

    /// Create a default configuration using the specified app key.
    ///
    /// ```
    /// # use attribution_core::ClientConfig;
    /// ClientConfig::from_app_key("key_live_abc123");
    /// ```
    pub fn from_app_key(app_key: impl Into<String>) -> Self {
        ClientConfig {
            app_key: app_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            read_timeout: ClientConfig::DEFAULT_READ_TIMEOUT,
            connect_timeout: ClientConfig::DEFAULT_CONNECT_TIMEOUT,
            max_retries: ClientConfig::DEFAULT_MAX_RETRIES,
            retry_interval: ClientConfig::DEFAULT_RETRY_INTERVAL,
            retry_jitter: ClientConfig::DEFAULT_RETRY_JITTER,
            collaborator_max_wait: ClientConfig::DEFAULT_COLLABORATOR_MAX_WAIT,
            store: None,
            transport: None,
            device_signals: Arc::new(NoDeviceSignals),
            referrer_providers: Vec::new(),
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Number of additional attempts for event requests that fail transiently.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Pause between retries. A random jitter of up to `jitter` is added.
    pub fn retry_interval(mut self, interval: Duration, jitter: Duration) -> Self {
        self.retry_interval = interval;
        self.retry_jitter = jitter;
        self
    }

    /// How long a session request waits for the advertising ID or install referrer.
    pub fn collaborator_max_wait(mut self, max_wait: Duration) -> Self {
        self.collaborator_max_wait = max_wait;
        self
    }

    /// Persistent storage. Defaults to an in-memory store.
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// HTTP client. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn device_signals(mut self, device_signals: SharedDeviceSignals) -> Self {
        self.device_signals = device_signals;
        self
    }

    /// Register an install referrer provider. The first available one is used.
    pub fn referrer_provider(mut self, provider: SharedReferrerProvider) -> Self {
        self.referrer_providers.push(provider);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```no_run
    /// # use attribution_core::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_app_key("key_live_abc123").to_client().unwrap();
    /// ```
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    /// Validate the configuration and resolve defaults.
    pub(crate) fn into_parts(self) -> Result<(Settings, Collaborators)> {
        let test_mode = validate_app_key(&self.app_key)?;
        if test_mode {
            log::info!(target: "attribution", "using a test app key");
        }

        let mut base_url = self.base_url;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base_url = Url::parse(&base_url).map_err(Error::InvalidBaseUrl)?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.connect_timeout)?),
        };
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        Ok((
            Settings {
                app_key: self.app_key,
                test_mode,
                base_url,
                read_timeout: self.read_timeout,
                connect_timeout: self.connect_timeout,
                max_retries: self.max_retries,
                retry_interval: self.retry_interval,
                retry_jitter: self.retry_jitter,
                collaborator_max_wait: self.collaborator_max_wait,
            },
            Collaborators {
                store,
                transport,
                device_signals: self.device_signals,
                referrer_providers: self.referrer_providers,
            },
        ))
    }
}

/// Validated settings shared by the queue and the bootstrap.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub app_key: String,
    pub test_mode: bool,
    pub base_url: Url,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub retry_jitter: Duration,
    pub collaborator_max_wait: Duration,
}

impl Settings {
    /// Upper bound for a single dispatch.
    pub fn task_timeout(&self) -> Duration {
        self.read_timeout + self.connect_timeout
    }
}

pub(crate) struct Collaborators {
    pub store: SharedStore,
    pub transport: SharedTransport,
    pub device_signals: SharedDeviceSignals,
    pub referrer_providers: Vec<SharedReferrerProvider>,
}

/// Check the app key format. Returns whether the key is a test key.
pub fn validate_app_key(app_key: &str) -> Result<bool> {
    static APP_KEY: OnceLock<Regex> = OnceLock::new();
    let regex = APP_KEY.get_or_init(|| {
        Regex::new(r"^key_(live|test)_[A-Za-z0-9]+$").expect("app key regex must be valid")
    });
    let captures = regex.captures(app_key).ok_or_else(|| {
        log::warn!(target: "attribution", "app key is invalid, check your configuration");
        Error::KeyInvalid
    })?;
    Ok(&captures[1] == "test")
}
