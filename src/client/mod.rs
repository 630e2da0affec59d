//! Per-instance session holder.
//!
//! An [`InstanceClient`] owns the HTTP transport for one endpoint and the
//! current session token pair. Authenticated requests that come back 401 are
//! handed to an injected [`Reauthenticate`] strategy once; the original request
//! is replayed only when that strategy reports success.
//!
//! Flow Overview:
//! - `authenticate` performs `POST /api/auth` and stores the returned session.
//! - `request` attaches `X-FTL-SID` / `X-FTL-CSRF`, re-authenticates at most once on 401.
//! - `ping` refreshes the session lifetime without ever re-authenticating.
//! - `logout` always drops the local session, whatever the server says.

pub mod api;
pub mod transport;

use crate::{error::ApiError, now_unix, registry::InstanceId};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::{debug, instrument, warn};

pub use transport::{ApiResponse, ApiTransport, TransportOptions};

/// Session lifetime the server assumes when it does not report one.
pub const DEFAULT_VALIDITY_SECONDS: u64 = 300;

/// Strategy invoked when an authenticated request is rejected with 401.
///
/// Returns `Ok(true)` when a fresh session has been installed on the client.
#[async_trait]
pub trait Reauthenticate: Send + Sync {
    async fn reauthenticate(&self, instance_id: &InstanceId) -> anyhow::Result<bool>;
}

/// Session token pair plus lifetime bookkeeping.
#[derive(Clone)]
pub struct Session {
    pub sid: SecretString,
    pub csrf: SecretString,
    pub validity: u64,
    pub expires_at: u64,
}

impl Session {
    #[must_use]
    pub fn new(sid: SecretString, csrf: SecretString, validity: u64, now: u64) -> Self {
        Self {
            sid,
            csrf,
            validity,
            expires_at: now.saturating_add(validity),
        }
    }

    /// Seconds until expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.remaining(now) == 0
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &"***")
            .field("csrf", &"***")
            .field("validity", &self.validity)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

static TOTP_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9]{6}$").ok());

/// Six-digit TOTP code.
#[derive(Clone, PartialEq, Eq)]
pub struct TotpCode(String);

impl TotpCode {
    /// # Errors
    /// Returns [`ApiError::InvalidTotp`] unless `code` is exactly six ASCII digits.
    pub fn parse(code: &str) -> Result<Self, ApiError> {
        let code = code.trim();
        if TOTP_PATTERN
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(code))
        {
            Ok(Self(code.to_string()))
        } else {
            Err(ApiError::InvalidTotp)
        }
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.0.parse().unwrap_or_default()
    }
}

impl std::fmt::Debug for TotpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TotpCode(******)")
    }
}

/// Result of a login attempt that reached the server.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Authenticated(Session),
    TotpRequired,
}

/// The server signals a missing second factor with a `bad_request` error whose
/// message mentions 2FA; the status code alone is ambiguous.
#[must_use]
pub fn is_totp_required(body: &Value) -> bool {
    let Some(error) = body.get("error") else {
        return false;
    };

    let key = error.get("key").and_then(Value::as_str).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();

    key == "bad_request" && message.to_ascii_uppercase().contains("2FA")
}

fn parse_session(body: &Value, now: u64) -> Result<Session, ApiError> {
    let session = body
        .get("session")
        .ok_or_else(|| ApiError::Decode("no session object in response".to_string()))?;

    if !session.get("valid").and_then(Value::as_bool).unwrap_or(false) {
        let message = session
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("session not valid");
        return Err(ApiError::AuthFailed(message.to_string()));
    }

    // passwordless servers answer with a valid session and no sid
    let sid = session
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let csrf = session
        .get("csrf")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let validity = session
        .get("validity")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_VALIDITY_SECONDS);

    Ok(Session::new(
        SecretString::from(sid.to_string()),
        SecretString::from(csrf.to_string()),
        validity,
        now,
    ))
}

pub struct InstanceClient {
    id: InstanceId,
    transport: ApiTransport,
    session: RwLock<Option<Session>>,
    reauth: Option<Arc<dyn Reauthenticate>>,
}

impl InstanceClient {
    /// # Errors
    /// Returns an error if the server address is invalid or the HTTP client cannot be built.
    pub fn new(
        id: InstanceId,
        server_url: &str,
        options: &TransportOptions,
        reauth: Option<Arc<dyn Reauthenticate>>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            id,
            transport: ApiTransport::new(server_url, options)?,
            session: RwLock::new(None),
            reauth,
        })
    }

    #[must_use]
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    /// Removes and returns the current session.
    pub fn take_session(&self) -> Option<Session> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Login with `password` and, when given, a TOTP code.
    ///
    /// # Errors
    /// Returns [`ApiError::AuthFailed`] when the server rejects the credentials,
    /// and transport errors unchanged. A missing second factor is not an error.
    #[instrument(skip(self, password, totp), fields(instance_id = %self.id))]
    pub async fn authenticate(
        &self,
        password: &SecretString,
        totp: Option<&TotpCode>,
    ) -> Result<AuthOutcome, ApiError> {
        let mut payload = json!({ "password": password.expose_secret() });
        if let Some(code) = totp {
            payload["totp"] = json!(code.value());
        }

        let response = self
            .transport
            .request_json(Method::POST, "/api/auth", None, Some(&payload))
            .await?;

        if is_totp_required(&response.body) {
            debug!("server requires a second factor");
            return Ok(AuthOutcome::TotpRequired);
        }

        if !response.status.is_success() {
            let message = transport::api_error_message(&response.body);
            return Err(match response.status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::AuthFailed(message),
                status => ApiError::from_status(status, message),
            });
        }

        let session = parse_session(&response.body, now_unix())?;
        debug!(validity = session.validity, "authenticated");
        self.set_session(Some(session.clone()));

        Ok(AuthOutcome::Authenticated(session))
    }

    /// Authenticated request with one re-authentication attempt on 401.
    ///
    /// # Errors
    /// Returns [`ApiError::AuthFailed`] when the session is rejected and could
    /// not be renewed, and classified transport or status errors otherwise.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let response = self.send(method.clone(), path, body).await?;

        if response.status != StatusCode::UNAUTHORIZED {
            return into_result(response);
        }

        let Some(hook) = &self.reauth else {
            self.set_session(None);
            return Err(ApiError::AuthFailed(transport::api_error_message(
                &response.body,
            )));
        };

        match hook.reauthenticate(&self.id).await {
            Ok(true) => {
                debug!(instance_id = %self.id, "re-authenticated, replaying {} {}", method, path);
                let retry = self.send(method, path, body).await?;
                if retry.status == StatusCode::UNAUTHORIZED {
                    self.set_session(None);
                }
                into_result(retry)
            }
            Ok(false) => {
                self.set_session(None);
                Err(ApiError::AuthFailed("session expired".to_string()))
            }
            Err(e) => {
                warn!(instance_id = %self.id, "re-authentication failed: {}", e);
                self.set_session(None);
                Err(ApiError::AuthFailed(e.to_string()))
            }
        }
    }

    /// Cheap authenticated call that extends the session lifetime.
    /// Never re-authenticates; 401 surfaces as [`ApiError::AuthFailed`].
    ///
    /// # Errors
    /// Returns an error if there is no session, it was rejected, or the transport failed.
    #[instrument(skip(self), fields(instance_id = %self.id))]
    pub async fn ping(&self) -> Result<Session, ApiError> {
        let Some(mut session) = self.session() else {
            return Err(ApiError::AuthFailed("no session".to_string()));
        };

        let response = self.send(Method::GET, "/api/auth", None).await?;
        let body = into_result(response)?;

        let now = now_unix();
        let refreshed = parse_session(&body, now)?;
        session.validity = refreshed.validity;
        session.expires_at = refreshed.expires_at;
        self.set_session(Some(session.clone()));

        Ok(session)
    }

    /// Drops the local session, then invalidates it server-side.
    ///
    /// # Errors
    /// Returns the server-side failure; the local session is gone either way.
    pub async fn logout(&self) -> Result<(), ApiError> {
        match self.take_session() {
            Some(session) => self.logout_session(&session).await,
            None => Ok(()),
        }
    }

    /// `DELETE /api/auth` for a session already removed from the client.
    ///
    /// # Errors
    /// Returns transport errors and unexpected statuses; 401/404 count as success.
    #[instrument(skip(self, session), fields(instance_id = %self.id))]
    pub async fn logout_session(&self, session: &Session) -> Result<(), ApiError> {
        let response = self
            .transport
            .request_json(Method::DELETE, "/api/auth", Some(session), None)
            .await?;

        match response.status {
            status if status.is_success() => Ok(()),
            // already gone on the server
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(()),
            status => Err(ApiError::from_status(
                status,
                transport::api_error_message(&response.body),
            )),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError> {
        let session = self.session();
        self.transport
            .request_json(method, path, session.as_ref(), body)
            .await
    }
}

fn into_result(response: ApiResponse) -> Result<Value, ApiError> {
    if response.status.is_success() {
        Ok(response.body)
    } else {
        Err(ApiError::from_status(
            response.status,
            transport::api_error_message(&response.body),
        ))
    }
}

impl std::fmt::Debug for InstanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceClient")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("has_session", &self.has_session())
            .finish_non_exhaustive()
    }
}
