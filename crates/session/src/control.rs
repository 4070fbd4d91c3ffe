//! The single write path into `TokenStore` and `SessionState`
//!
//! Every store write is paired with the publish that describes it, and the
//! pair runs under one async lock. That keeps the publish order identical to
//! the store write order, whichever of login, logout or a refresh commit
//! gets there first.
//!
//! Login, logout and restore bump the session epoch. A refresh remembers the
//! epoch it started under and its commit is discarded if the epoch moved in
//! the meantime, so a refresh that began before a logout can never bring the
//! old session back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use credential::{Credential, TokenStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::state::{AuthState, SessionState};

pub struct SessionControl {
    store: Arc<TokenStore>,
    state: SessionState,
    /// Subject of the current session. The lock is the commit lock.
    subject: Mutex<Option<String>>,
    epoch: AtomicU64,
}

impl SessionControl {
    pub fn new(store: Arc<TokenStore>, state: SessionState) -> Self {
        Self {
            store,
            state,
            subject: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current session epoch.
    ///
    /// Writers change the store before bumping the epoch, so a reader that
    /// loads the epoch first and the store second never pairs a fresh store
    /// value with a stale epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Start a session with an externally obtained credential.
    ///
    /// The credential and `Authenticated` state are in effect even when
    /// persisting to the backend fails; that error is still returned.
    pub async fn login(&self, credential: Credential, subject: impl Into<String>) -> Result<()> {
        let subject = subject.into();
        let mut current_subject = self.subject.lock().await;

        let persisted = self.store.set(credential.clone()).await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *current_subject = Some(subject.clone());

        info!(
            subject,
            fingerprint = credential.fingerprint(),
            expires_at = credential.expires_at,
            "session started"
        );
        self.state.publish(AuthState::Authenticated {
            credential,
            subject,
        });
        Ok(persisted?)
    }

    /// End the session: clear the store and publish `Unauthenticated`.
    pub async fn logout(&self) -> Result<()> {
        let mut current_subject = self.subject.lock().await;

        let cleared = self.store.clear().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = current_subject.take();

        info!(subject = previous.as_deref(), "session ended");
        self.state.publish(AuthState::Unauthenticated);
        Ok(cleared?)
    }

    /// Resume a session persisted by a previous process.
    ///
    /// A stored credential that is already past expiry is published as
    /// `Expired` and kept, so the first outbound call refreshes it.
    pub async fn restore(&self, subject: impl Into<String>) -> Result<AuthState> {
        let subject = subject.into();
        let mut current_subject = self.subject.lock().await;

        let loaded = self.store.load().await?;
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let state = match loaded {
            Some(credential) if credential.is_expired(Duration::ZERO) => {
                info!(
                    fingerprint = credential.fingerprint(),
                    "restored credential is expired"
                );
                *current_subject = Some(subject);
                AuthState::Expired {
                    last_credential: credential,
                }
            }
            Some(credential) => {
                info!(
                    subject,
                    fingerprint = credential.fingerprint(),
                    "session restored"
                );
                *current_subject = Some(subject.clone());
                AuthState::Authenticated {
                    credential,
                    subject,
                }
            }
            None => {
                debug!("no stored credential to restore");
                *current_subject = None;
                AuthState::Unauthenticated
            }
        };
        self.state.publish(state.clone());
        Ok(state)
    }

    /// Publish `Expired` for the credential a refresh is about to replace.
    pub(crate) async fn mark_expired(&self, epoch: u64, credential: &Credential) -> bool {
        let _commit = self.subject.lock().await;
        if self.epoch() != epoch {
            return false;
        }
        self.state.publish(AuthState::Expired {
            last_credential: credential.clone(),
        });
        true
    }

    /// Store a refreshed credential and publish `Authenticated`.
    ///
    /// Returns false without touching anything if the session changed after
    /// the refresh started.
    pub(crate) async fn commit_refresh(&self, epoch: u64, credential: Credential) -> bool {
        let current_subject = self.subject.lock().await;
        if self.epoch() != epoch {
            debug!(
                fingerprint = credential.fingerprint(),
                "session changed during refresh, discarding result"
            );
            return false;
        }

        if let Err(e) = self.store.set(credential.clone()).await {
            warn!(error = %e, "failed to persist refreshed credential");
        }
        self.state.publish(AuthState::Authenticated {
            credential,
            subject: current_subject.clone().unwrap_or_default(),
        });
        true
    }

    /// Undo `mark_expired` after a transient refresh failure.
    ///
    /// Publishes `Authenticated` again when the store still holds `credential`
    /// and it has not actually expired. Returns whether it did.
    pub(crate) async fn recover_refresh(&self, epoch: u64, credential: &Credential) -> bool {
        let current_subject = self.subject.lock().await;
        if self.epoch() != epoch || credential.is_expired(Duration::ZERO) {
            return false;
        }
        match self.store.get() {
            Some(stored) if stored.same_as(credential) => {}
            _ => return false,
        }

        debug!(
            fingerprint = credential.fingerprint(),
            "refresh failed but credential is still valid, session stays authenticated"
        );
        self.state.publish(AuthState::Authenticated {
            credential: credential.clone(),
            subject: current_subject.clone().unwrap_or_default(),
        });
        true
    }

    /// Clear the store and publish `RefreshFailed`.
    pub(crate) async fn fail_refresh(&self, epoch: u64, reason: &str) -> bool {
        let mut current_subject = self.subject.lock().await;
        if self.epoch() != epoch {
            debug!(reason, "session changed during refresh, ignoring failure");
            return false;
        }

        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear credential after denied refresh");
        }
        current_subject.take();
        self.state.publish(AuthState::RefreshFailed {
            reason: reason.to_string(),
        });
        true
    }
}
