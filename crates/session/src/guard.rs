//! Synchronous allow/deny decision from the current session state
//!
//! The guard only reads `SessionState::current()`. It never refreshes and
//! never suspends, so it is safe to call from request filters and health
//! checks.

use crate::state::{AuthState, SessionState};

/// Why access was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// No session was ever started, or it was logged out.
    Unauthenticated,
    /// A refresh is in progress, or the credential is past expiry and its
    /// last refresh failed transiently.
    Expired,
    /// The issuer rejected the refresh secret.
    RefreshFailed(String),
}

impl DenyReason {
    pub fn label(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::Expired => "expired",
            DenyReason::RefreshFailed(_) => "refresh_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny(DenyReason),
}

impl Access {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Access::Allow)
    }
}

/// Read-only gate over `SessionState`.
#[derive(Clone)]
pub struct AccessGuard {
    state: SessionState,
}

impl AccessGuard {
    pub fn new(state: SessionState) -> Self {
        Self { state }
    }

    pub fn check(&self) -> Access {
        match self.state.current() {
            AuthState::Authenticated { .. } => Access::Allow,
            AuthState::Unauthenticated => Access::Deny(DenyReason::Unauthenticated),
            AuthState::Expired { .. } => Access::Deny(DenyReason::Expired),
            AuthState::RefreshFailed { reason } => Access::Deny(DenyReason::RefreshFailed(reason)),
        }
    }
}
