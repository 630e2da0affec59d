//! Error taxonomy shared by the client, registry and session manager.
//!
//! Transport failures are classified into a small set of kinds so the lifecycle
//! can decide what to retry and what to count against the circuit breaker, and
//! so callers can show one actionable sentence instead of a raw transport error.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("instance has no endpoint configured")]
    NotConfigured,
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("invalid TOTP code")]
    InvalidTotp,
    #[error("no password available")]
    PasswordRequired,
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("cancelled: instance changed while the request was in flight")]
    Cancelled,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Coarse classification used for retry policy and user-facing messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    NotConfigured,
    Network,
    Timeout,
    AuthFailed,
    PasswordRequired,
    Certificate,
    Server,
    Client,
    Cancelled,
    Storage,
}

impl ErrorKind {
    /// Human-readable, actionable message for this kind of failure.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::NotConfigured => "No server address configured. Add the Pi-hole URL first.",
            ErrorKind::Network => "Can't reach the Pi-hole. Check the address and your network.",
            ErrorKind::Timeout => "The Pi-hole did not answer in time. It may be busy or offline.",
            ErrorKind::AuthFailed => "Wrong password or 2FA code.",
            ErrorKind::PasswordRequired => "Password needed. Enter it again to reconnect.",
            ErrorKind::Certificate => {
                "The server certificate is not trusted. Install the certificate or use HTTP."
            }
            ErrorKind::Server => "The Pi-hole reported an internal error. Try again shortly.",
            ErrorKind::Client => "The Pi-hole rejected the request.",
            ErrorKind::Cancelled => "The instance changed before the request finished.",
            ErrorKind::Storage => "Could not read or write the instance configuration.",
        }
    }

    /// Transient failures are retried on the normal keepalive schedule.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }
}

impl ApiError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NotConfigured | ApiError::UnknownInstance(_) => ErrorKind::NotConfigured,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::AuthFailed(_) | ApiError::InvalidTotp => ErrorKind::AuthFailed,
            ApiError::PasswordRequired => ErrorKind::PasswordRequired,
            ApiError::Certificate(_) => ErrorKind::Certificate,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Client { .. } | ApiError::Decode(_) => ErrorKind::Client,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only server-side credential rejections count against the breaker.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::AuthFailed(_))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            // trust failures are shown as-is so the user can act on them
            ApiError::Certificate(detail) => {
                format!("{} ({detail})", ErrorKind::Certificate.user_message())
            }
            _ => self.kind().user_message().to_string(),
        }
    }

    /// Classify a non-success HTTP status. `message` is the server's error text.
    #[must_use]
    pub fn from_status(status: StatusCode, message: String) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            ApiError::AuthFailed(message)
        } else if status.is_server_error() {
            ApiError::Server {
                status: status.as_u16(),
                message,
            }
        } else {
            ApiError::Client {
                status: status.as_u16(),
                message,
            }
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return ApiError::Timeout;
        }

        if let Some(detail) = certificate_detail(&err) {
            return ApiError::Certificate(detail);
        }

        if err.is_decode() {
            return ApiError::Decode(err.to_string());
        }

        ApiError::Network(error_chain(&err))
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

// reqwest does not expose TLS failures as a kind; the cause sits in the source chain.
fn certificate_detail(err: &reqwest::Error) -> Option<String> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string();
        if text.to_lowercase().contains("certificate") {
            return Some(text);
        }
        source = inner.source();
    }
    None
}
