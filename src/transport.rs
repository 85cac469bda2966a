//! Wire-level HTTP client used to execute requests.
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::{request::Payload, Error};

/// Key under which the app key travels with every request.
pub const APP_KEY_PARAM: &str = "branch_key";

/// Result of a single network call.
///
/// Transport failures are not reported as errors: they are folded into a response with a
/// negative, locally synthesized status code (see [`Error::ERR_NO_CONNECTIVITY`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerResponse {
    /// HTTP status code, or a negative local code.
    pub status_code: i32,
    /// Parsed JSON body. `None` when the body was missing or not valid JSON.
    pub body: Option<Value>,
    /// Human-readable failure reason, if any.
    pub failure_reason: Option<String>,
}

impl ServerResponse {
    pub fn ok(body: Value) -> ServerResponse {
        ServerResponse {
            status_code: 200,
            body: Some(body),
            failure_reason: None,
        }
    }

    pub fn error(status_code: i32, reason: impl Into<String>) -> ServerResponse {
        ServerResponse {
            status_code,
            body: None,
            failure_reason: Some(reason.into()),
        }
    }

    pub fn timed_out() -> ServerResponse {
        ServerResponse::error(Error::ERR_REQ_TIMED_OUT, "request timed out")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Failure reason, falling back to the server-provided error message.
    pub fn reason(&self) -> String {
        if let Some(reason) = &self.failure_reason {
            return reason.clone();
        }
        self.body
            .as_ref()
            .and_then(|body| body.pointer("/error/message"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("status {}", self.status_code))
    }
}

/// HTTP client collaborator.
///
/// Implementations must be blocking. Each call runs on a dedicated background thread and is
/// abandoned by the queue once `timeout` elapses.
pub trait Transport {
    fn post(&self, url: &Url, payload: &Payload, app_key: &str, timeout: Duration)
        -> ServerResponse;

    fn get(&self, url: &Url, params: &Payload, app_key: &str, timeout: Duration)
        -> ServerResponse;
}

/// Shared handle to a transport.
pub type SharedTransport = std::sync::Arc<dyn Transport + Send + Sync>;

/// [`Transport`] built on the blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    // Client holds a connection pool internally, so it is reused between requests.
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> crate::Result<HttpTransport> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("attribution-core/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpTransport { client })
    }

    fn execute(&self, request: reqwest::blocking::RequestBuilder) -> ServerResponse {
        let response = match request.send() {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return ServerResponse::timed_out(),
            Err(err) => {
                log::warn!(target: "attribution", "network error: {err}");
                return ServerResponse::error(
                    Error::ERR_NO_CONNECTIVITY,
                    err.without_url().to_string(),
                );
            }
        };

        let status_code = i32::from(response.status().as_u16());
        let body = match response.text() {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => serde_json::from_str(&text)
                .inspect_err(|err| {
                    log::warn!(target: "attribution", status = status_code; "failed to parse response body: {err}")
                })
                .ok(),
            Err(err) if err.is_timeout() => return ServerResponse::timed_out(),
            Err(err) => {
                return ServerResponse::error(
                    Error::ERR_NO_CONNECTIVITY,
                    err.without_url().to_string(),
                )
            }
        };

        ServerResponse {
            status_code,
            body,
            failure_reason: None,
        }
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        url: &Url,
        payload: &Payload,
        app_key: &str,
        timeout: Duration,
    ) -> ServerResponse {
        let mut body = payload.clone();
        body.insert(APP_KEY_PARAM.to_owned(), Value::String(app_key.to_owned()));
        log::trace!(target: "attribution", url = url.as_str(), body:serde; "posting request");
        self.execute(self.client.post(url.clone()).json(&body).timeout(timeout))
    }

    fn get(
        &self,
        url: &Url,
        params: &Payload,
        app_key: &str,
        timeout: Duration,
    ) -> ServerResponse {
        let mut url = url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(APP_KEY_PARAM, app_key);
            for (key, value) in params {
                match value {
                    Value::String(value) => query.append_pair(key, value),
                    value => query.append_pair(key, &value.to_string()),
                };
            }
        }
        log::trace!(target: "attribution", url = url.as_str(); "getting request");
        self.execute(self.client.get(url).timeout(timeout))
    }
}
