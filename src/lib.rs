//! # Holeguard (Pi-hole v6 session & credential manager)
//!
//! `holeguard` keeps authenticated sessions alive against one or more Pi-hole
//! v6 style servers ("instances") that expose a session-based REST API with
//! password and optional TOTP authentication.
//!
//! ## Credentials
//!
//! Server passwords are never stored in clear. Each password is encrypted under
//! a random per-process master key (PBKDF2-HMAC-SHA256 + ChaCha20-Poly1305).
//! The master key lives only in memory unless the user opts into
//! "remember password", in which case it is wrapped under a fixed, embedded
//! value and written next to the instance. That mode is a convenience, not a
//! security boundary.
//!
//! ## Sessions
//!
//! The [`session::SessionManager`] is the context object that drives connect,
//! keepalive, renewal and disconnect for every instance. Session tokens are kept
//! in process memory only, sealed under an ephemeral key. A per-instance
//! [`breaker::CircuitBreaker`] stops automatic re-authentication after repeated
//! rejections, and a transition guard cancels in-flight work for instances that
//! are switched or deleted.

pub mod breaker;
pub mod cli;
pub mod client;
pub mod crypto;
pub mod error;
pub mod registry;
pub mod session;
pub mod state;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_user_agent() {
        assert!(APP_USER_AGENT.starts_with("holeguard/"));
    }
}
