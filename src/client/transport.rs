//! HTTP transport for one Pi-hole endpoint.
//!
//! Keeps request construction, timeouts and error classification in one place
//! so every API call shares them. Session headers are optional and only sent
//! when a session with a non-empty sid is present.

use crate::{client::Session, error::ApiError};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};
use url::Url;

pub const SID_HEADER: &str = "X-FTL-SID";
pub const CSRF_HEADER: &str = "X-FTL-CSRF";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub user_agent: String,
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            user_agent: crate::APP_USER_AGENT.to_string(),
            timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
        }
    }
}

/// Response wrapper for API requests.
#[derive(Debug)]
pub struct ApiResponse {
    pub url: String,
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Clone)]
pub struct ApiTransport {
    client: reqwest::Client,
    base_url: String,
}

/// Normalize a user-entered server address to the URL that `/api/...` paths hang off.
///
/// Accepts `http://pi.hole`, `http://pi.hole/admin/` or `https://pi.hole:8443/api`.
///
/// # Errors
/// Returns [`ApiError::NotConfigured`] for an empty address and a client error
/// for anything that is not an absolute http(s) URL with a host.
pub fn normalize_base_url(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::NotConfigured);
    }

    let url = Url::parse(trimmed).map_err(|e| ApiError::Client {
        status: 0,
        message: format!("invalid server URL: {e}"),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ApiError::Client {
                status: 0,
                message: format!("unsupported scheme {scheme}"),
            })
        }
    }

    if url.host_str().is_none() {
        return Err(ApiError::Client {
            status: 0,
            message: "invalid server URL: no host specified".to_string(),
        });
    }

    let mut base = url.as_str().trim_end_matches('/').to_string();
    for suffix in ["/admin", "/api"] {
        if let Some(stripped) = base.strip_suffix(suffix) {
            base = stripped.to_string();
        }
    }

    Ok(base)
}

/// Percent-encode a single path segment (domains may be regular expressions).
#[must_use]
pub fn encode_segment(segment: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return segment.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.push(segment);
    }
    url.path().trim_start_matches('/').to_string()
}

/// Best-effort extraction of the server's error text.
#[must_use]
pub fn api_error_message(body: &Value) -> String {
    if let Some(message) = body
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
    {
        return message.to_string();
    }

    if let Some(message) = body
        .get("session")
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
    {
        return message.to_string();
    }

    body.as_str().unwrap_or_default().to_string()
}

impl ApiTransport {
    /// Build a transport for the given server address.
    ///
    /// # Errors
    /// Returns an error if the address is invalid or the HTTP client cannot be constructed.
    pub fn new(server_url: &str, options: &TransportOptions) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(server_url)?;

        let client = reqwest::Client::builder()
            .user_agent(&options.user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(ApiError::from)?;

        Ok(Self { client, base_url })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the absolute URL for an `/api/...` path.
    ///
    /// # Errors
    /// Returns an error if the path does not start with `/`.
    pub fn endpoint_url(&self, path: &str) -> Result<String, ApiError> {
        if !path.starts_with('/') {
            return Err(ApiError::Client {
                status: 0,
                message: "api path must start with /".to_string(),
            });
        }

        let endpoint_url = format!("{}{path}", self.base_url);

        debug!("endpoint URL: {}", endpoint_url);

        Ok(endpoint_url)
    }

    /// Execute a JSON request. Non-success statuses are returned, not raised.
    ///
    /// # Errors
    /// Returns an error on transport failure or when a success body is not JSON.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        session: Option<&Session>,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.endpoint_url(path)?;

        let span = info_span!(
            "pihole.request",
            http.method = %method,
            url = %url
        );

        let mut request = self
            .client
            .request(method, &url)
            .header("Accept", "application/json");

        if let Some(session) = session {
            let sid = session.sid.expose_secret();
            if !sid.is_empty() {
                request = request.header(SID_HEADER, sid);
            }
            let csrf = session.csrf.expose_secret();
            if !csrf.is_empty() {
                request = request.header(CSRF_HEADER, csrf);
            }
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().instrument(span).await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => value,
                Err(e) if status.is_success() => {
                    return Err(ApiError::Decode(format!("{url}: {e}")));
                }
                Err(_) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            }
        };

        debug!(status = status.as_u16(), "response from {}", url);

        Ok(ApiResponse { url, status, body })
    }
}

impl std::fmt::Debug for ApiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
