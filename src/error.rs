use std::sync::Arc;

/// Represents a result type for operations in the attribution SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors delivered to request callbacks and returned from client operations.
///
/// Every variant maps to a stable numeric code (see [`Error::code`]) so that callers on the other
/// side of an FFI boundary can match on it.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The request needs an established session but none exists.
    #[error("session not initialized, request needs an active session")]
    NoSession,

    /// A short link with the same alias already exists.
    #[error("trouble creating a URL with that alias, it is already taken")]
    DuplicateUrl,

    /// The request did not complete within the task timeout.
    #[error("request timed out")]
    RequestTimedOut,

    /// The server returned a 5xx status.
    #[error("unable to reach the servers (status {status}): {message}")]
    UnableToReachServers {
        /// HTTP status code returned by the server.
        status: i32,
        /// Failure reason reported by the transport.
        message: String,
    },

    /// The transport could not reach the network at all.
    #[error("poor network connectivity: {0}")]
    NoConnectivity(String),

    /// The application key is missing or invalid.
    #[error("app key is invalid")]
    KeyInvalid,

    /// The server reported a conflicting resource.
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// The request was rejected by the server or could not be built locally.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Tracking is disabled and the request cannot execute without it.
    #[error("tracking is disabled, request cannot be completed")]
    TrackingDisabled,

    /// A session is already initialized and no new session was requested.
    #[error("session is already initialized")]
    AlreadyInitialized,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error reported by the HTTP client.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Payload or persisted queue could not be (de)serialized.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),
}

impl Error {
    /// Code used when a status is synthesized locally for a timed out task.
    pub const ERR_REQ_TIMED_OUT: i32 = -111;
    /// Code used when a status is synthesized locally for a missing network.
    pub const ERR_NO_CONNECTIVITY: i32 = -113;
    /// Code used when a status is synthesized locally for disabled tracking.
    pub const ERR_TRACKING_DISABLED: i32 = -117;

    /// Stable numeric code of the error.
    pub fn code(&self) -> i32 {
        match self {
            Error::NoSession => -101,
            Error::DuplicateUrl => -105,
            Error::RequestTimedOut => Self::ERR_REQ_TIMED_OUT,
            Error::UnableToReachServers { .. } => -112,
            Error::NoConnectivity(_) => Self::ERR_NO_CONNECTIVITY,
            Error::KeyInvalid => -114,
            Error::ResourceConflict(_) => -115,
            Error::InvalidRequest(_) => -116,
            Error::TrackingDisabled => Self::ERR_TRACKING_DISABLED,
            Error::AlreadyInitialized => -118,
            Error::InvalidBaseUrl(_)
            | Error::Io(_)
            | Error::Network(_)
            | Error::Serialization(_) => -1,
        }
    }

    /// Map a response status (HTTP or locally synthesized negative code) to an error.
    pub fn from_status(status: i32, message: impl Into<String>) -> Error {
        let message = message.into();
        match status {
            Self::ERR_REQ_TIMED_OUT => Error::RequestTimedOut,
            Self::ERR_TRACKING_DISABLED => Error::TrackingDisabled,
            Self::ERR_NO_CONNECTIVITY => Error::NoConnectivity(message),
            401 | 403 => Error::KeyInvalid,
            409 => Error::ResourceConflict(message),
            s if s >= 500 => Error::UnableToReachServers { status, message },
            s if s >= 400 => Error::InvalidRequest(message),
            _ => Error::NoConnectivity(message),
        }
    }

    /// Whether a failed response with this status should never be retried.
    pub fn is_non_retryable_status(status: i32) -> bool {
        (400..=451).contains(&status) || status == Self::ERR_TRACKING_DISABLED
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}
