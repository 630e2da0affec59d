//! Typed wrappers for the fixed set of REST operations.

use super::{transport::encode_segment, InstanceClient};
use crate::error::ApiError;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainList {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Exact,
    Regex,
}

impl fmt::Display for DomainList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DomainList::Allow => "allow",
            DomainList::Deny => "deny",
        })
    }
}

impl fmt::Display for DomainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DomainKind::Exact => "exact",
            DomainKind::Regex => "regex",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BlockingStatus {
    /// `enabled`, `disabled`, `failed` or `unknown`.
    pub blocking: String,
    /// Seconds until the blocking state flips back, when a timer is set.
    #[serde(default)]
    pub timer: Option<f64>,
}

impl BlockingStatus {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.blocking == "enabled"
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))
}

impl InstanceClient {
    /// `GET /api/stats/summary`
    ///
    /// # Errors
    /// Returns classified request errors.
    pub async fn stats_summary(&self) -> Result<Value, ApiError> {
        self.request(Method::GET, "/api/stats/summary", None).await
    }

    /// `GET /api/dns/blocking`
    ///
    /// # Errors
    /// Returns classified request errors or a decode error for an unexpected body.
    pub async fn blocking_status(&self) -> Result<BlockingStatus, ApiError> {
        decode(self.request(Method::GET, "/api/dns/blocking", None).await?)
    }

    /// `POST /api/dns/blocking`; `timer` reverts the change after that many seconds.
    ///
    /// # Errors
    /// Returns classified request errors or a decode error for an unexpected body.
    pub async fn set_blocking(
        &self,
        enabled: bool,
        timer: Option<u64>,
    ) -> Result<BlockingStatus, ApiError> {
        let payload = json!({ "blocking": enabled, "timer": timer });
        decode(
            self.request(Method::POST, "/api/dns/blocking", Some(&payload))
                .await?,
        )
    }

    /// `GET /api/queries` with optional filter parameters (`length`, `from`, `domain`, ...).
    ///
    /// # Errors
    /// Returns classified request errors.
    pub async fn queries(&self, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let mut path = String::from("/api/queries");
        if !params.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
                .finish();
            path.push('?');
            path.push_str(&query);
        }
        self.request(Method::GET, &path, None).await
    }

    /// `GET /api/domains/{list}/{kind}`
    ///
    /// # Errors
    /// Returns classified request errors.
    pub async fn domains(&self, list: DomainList, kind: DomainKind) -> Result<Value, ApiError> {
        self.request(Method::GET, &format!("/api/domains/{list}/{kind}"), None)
            .await
    }

    /// `POST /api/domains/{list}/{kind}`
    ///
    /// # Errors
    /// Returns classified request errors.
    pub async fn add_domain(
        &self,
        list: DomainList,
        kind: DomainKind,
        domain: &str,
        comment: Option<&str>,
    ) -> Result<Value, ApiError> {
        let payload = json!({
            "domain": domain,
            "comment": comment,
            "enabled": true
        });
        self.request(
            Method::POST,
            &format!("/api/domains/{list}/{kind}"),
            Some(&payload),
        )
        .await
    }

    /// `DELETE /api/domains/{list}/{kind}/{domain}`
    ///
    /// # Errors
    /// Returns classified request errors.
    pub async fn remove_domain(
        &self,
        list: DomainList,
        kind: DomainKind,
        domain: &str,
    ) -> Result<(), ApiError> {
        let path = format!("/api/domains/{list}/{kind}/{}", encode_segment(domain));
        self.request(Method::DELETE, &path, None).await.map(|_| ())
    }

    /// `GET /api/search/{domain}`
    ///
    /// # Errors
    /// Returns classified request errors.
    pub async fn search(&self, domain: &str) -> Result<Value, ApiError> {
        let path = format!("/api/search/{}", encode_segment(domain));
        self.request(Method::GET, &path, None).await
    }
}
