//! Credential-attaching call wrapper with refresh-and-retry-once
//!
//! `RequestGateway::execute` runs a caller-supplied call with the current
//! credential. When the credential is missing, stale, or rejected by the
//! remote side, the gateway asks the coordinator for a fresher one and runs
//! the call exactly once more. A second rejection is terminal.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use credential::Credential;
use session::RefreshCoordinator;
use tracing::{debug, warn};

use crate::error::{CallError, Error, Result};

/// Default margin before `expires_at` at which a credential counts as stale.
pub const DEFAULT_EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Refresh up front when the stored credential is past (or within
    /// `expiry_leeway` of) its expiry. When off, the stored credential is
    /// always attached first and only a rejection triggers a refresh.
    pub refresh_before_expiry: bool,
    pub expiry_leeway: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            refresh_before_expiry: true,
            expiry_leeway: DEFAULT_EXPIRY_LEEWAY,
        }
    }
}

/// Wraps outbound calls that need the session credential.
#[derive(Clone)]
pub struct RequestGateway {
    coordinator: RefreshCoordinator,
    config: GatewayConfig,
    /// Refreshed credential that was issued already inside `expiry_leeway`.
    /// It is attached until it actually expires instead of being refreshed
    /// again on every call.
    short_lived: Arc<Mutex<Option<Credential>>>,
}

impl RequestGateway {
    pub fn new(coordinator: RefreshCoordinator, config: GatewayConfig) -> Self {
        Self {
            coordinator,
            config,
            short_lived: Arc::new(Mutex::new(None)),
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    fn usable(&self, credential: &Credential) -> bool {
        if !self.config.refresh_before_expiry || !credential.is_expired(self.config.expiry_leeway) {
            return true;
        }
        !credential.is_expired(Duration::ZERO) && self.is_short_lived(credential)
    }

    fn is_short_lived(&self, credential: &Credential) -> bool {
        self.short_lived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|c| c.same_as(credential))
    }

    /// Remember `fresh` if the issuer handed it out already inside the leeway.
    fn note_refreshed(&self, fresh: &Credential) {
        if !self.config.refresh_before_expiry
            || !fresh.is_expired(self.config.expiry_leeway)
            || self.is_short_lived(fresh)
        {
            return;
        }
        warn!(
            fingerprint = fresh.fingerprint(),
            expires_at = fresh.expires_at,
            expiry_leeway_secs = self.config.expiry_leeway.as_secs(),
            "issuer minted a credential shorter-lived than the expiry leeway, using it until it expires"
        );
        *self.short_lived.lock().unwrap_or_else(PoisonError::into_inner) = Some(fresh.clone());
    }

    /// Run `call` with the session credential.
    ///
    /// `call` is invoked at most twice: with the stored credential, then, if
    /// that one is rejected with `CallError::Unauthorized`, with a refreshed
    /// one. When the stored credential is missing or stale it is invoked only
    /// once, after the refresh.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let result = self.attempt(call).await;
        let outcome = match &result {
            Ok((_, false)) => "success",
            Ok((_, true)) => "refreshed",
            Err(e) => e.label(),
        };
        metrics::counter!("gateway_calls_total", "outcome" => outcome).increment(1);
        result.map(|(value, _)| value)
    }

    /// Returns the call's value and whether a refresh was needed.
    async fn attempt<T, F, Fut>(&self, call: F) -> Result<(T, bool)>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let seen = match self.coordinator.control().store().get() {
            Some(credential) if self.usable(&credential) => {
                match call(credential.clone()).await {
                    Ok(value) => return Ok((value, false)),
                    Err(CallError::Unauthorized(reason)) => {
                        debug!(
                            fingerprint = credential.fingerprint(),
                            reason, "credential rejected, refreshing"
                        );
                        Some(credential)
                    }
                    Err(CallError::Transport(reason)) => {
                        return Err(Error::TransportFailure(reason));
                    }
                }
            }
            Some(credential) => {
                debug!(
                    fingerprint = credential.fingerprint(),
                    expires_at = credential.expires_at,
                    "stored credential is stale, refreshing before call"
                );
                Some(credential)
            }
            None => None,
        };

        let fresh = self.coordinator.ensure_fresh(seen.as_ref()).await?;
        self.note_refreshed(&fresh);

        match call(fresh.clone()).await {
            Ok(value) => Ok((value, true)),
            Err(CallError::Unauthorized(reason)) => {
                warn!(
                    fingerprint = fresh.fingerprint(),
                    reason, "refreshed credential rejected"
                );
                Err(Error::AuthorizationRejected(reason))
            }
            Err(CallError::Transport(reason)) => Err(Error::TransportFailure(reason)),
        }
    }
}
