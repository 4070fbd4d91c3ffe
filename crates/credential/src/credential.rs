//! The credential attached to outbound calls
//!
//! A `Credential` is immutable once issued. A refresh or login produces a new
//! value that replaces the old one wholesale; nothing mutates it in place.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Access/refresh secret pair with its expiry.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute, not a delta).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer secret attached to outbound calls
    pub access: Secret<String>,
    /// Secret traded at the issuer for a new credential
    pub refresh: Secret<String>,
    /// Expiration as unix timestamp in milliseconds
    pub expires_at: u64,
}

impl Credential {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>, expires_at: u64) -> Self {
        Self {
            access: Secret::new(access.into()),
            refresh: Secret::new(refresh.into()),
            expires_at,
        }
    }

    /// Whether the credential expires within `leeway` of `now` (unix ms).
    pub fn is_expired_at(&self, now: u64, leeway: Duration) -> bool {
        self.expires_at <= now.saturating_add(leeway.as_millis() as u64)
    }

    /// Whether the credential expires within `leeway` of the current time.
    pub fn is_expired(&self, leeway: Duration) -> bool {
        self.is_expired_at(now_millis(), leeway)
    }

    /// Identity comparison: same access secret and same expiry.
    pub fn same_as(&self, other: &Credential) -> bool {
        self.access.matches(&other.access) && self.expires_at == other.expires_at
    }

    /// Whether this credential replaced `other`: a different credential that
    /// does not expire earlier.
    pub fn supersedes(&self, other: &Credential) -> bool {
        !self.same_as(other) && self.expires_at >= other.expires_at
    }

    /// Short, stable identifier safe to log.
    ///
    /// First 9 bytes of SHA-256 over the access secret, base64url encoded
    /// (12 characters). Never reversible to the secret.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.access.expose().as_bytes());
        URL_SAFE_NO_PAD.encode(&hash[..9])
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
