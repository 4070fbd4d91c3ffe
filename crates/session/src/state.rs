//! Authentication state and its multicast container
//!
//! `SessionState` holds exactly one current `AuthState` and fans every
//! publish out to all subscribers. A new subscriber gets the latest state
//! queued immediately (replay-latest, not history) and then every later
//! publish, in publish order.
//!
//! Each subscriber owns an unbounded channel. `publish` only enqueues, so a
//! subscriber that never drains its queue slows nobody else down. The
//! current value and the subscriber list share one lock, which makes
//! "read current + register" in `subscribe` a single step and gives all
//! publishes one total order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use credential::Credential;
use tokio::sync::mpsc;
use tracing::debug;

/// Authentication status broadcast to observers.
///
/// Transitions:
/// - Unauthenticated → Authenticated (login)
/// - Authenticated → Expired (refresh started)
/// - Expired → Authenticated (refresh succeeded)
/// - Expired → RefreshFailed (issuer denied the refresh secret)
/// - any → Unauthenticated (logout)
#[derive(Debug, Clone)]
pub enum AuthState {
    Unauthenticated,
    Authenticated {
        credential: Credential,
        subject: String,
    },
    Expired {
        last_credential: Credential,
    },
    RefreshFailed {
        reason: String,
    },
}

impl AuthState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticated { .. } => "authenticated",
            AuthState::Expired { .. } => "expired",
            AuthState::RefreshFailed { .. } => "refresh_failed",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }

    /// Credential carried by the state, if any.
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            AuthState::Authenticated { credential, .. } => Some(credential),
            AuthState::Expired { last_credential } => Some(last_credential),
            AuthState::Unauthenticated | AuthState::RefreshFailed { .. } => None,
        }
    }
}

struct Inner {
    current: AuthState,
    /// Number of publishes applied so far
    version: u64,
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<AuthState>)>,
}

/// Replay-latest multicast container for `AuthState`.
///
/// Cheap to clone; clones share the same state and subscriber set.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<Mutex<Inner>>,
}

impl SessionState {
    /// New container holding `Unauthenticated`.
    pub fn new() -> Self {
        Self::with_initial(AuthState::Unauthenticated)
    }

    pub fn with_initial(initial: AuthState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                current: initial,
                version: 0,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current state and notify every subscriber.
    ///
    /// Subscribers whose receiving side is gone are dropped from the list.
    pub fn publish(&self, state: AuthState) {
        let mut inner = self.lock();
        inner.current = state.clone();
        inner.version += 1;
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(state.clone()).is_ok());
        debug!(
            state = state.label(),
            version = inner.version,
            subscribers = inner.subscribers.len(),
            "session state published"
        );
    }

    /// Register a subscriber.
    ///
    /// The returned handle already holds the current state; `try_recv`
    /// yields it without waiting.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        // Receiver is alive in this scope, send cannot fail
        let _ = tx.send(inner.current.clone());
        inner.subscribers.push((id, tx));
        Subscription {
            id,
            rx,
            state: Arc::downgrade(&self.inner),
        }
    }

    /// Stop delivering to `subscription`. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Clone of the current state. Never blocks on subscribers.
    pub fn current(&self) -> AuthState {
        self.lock().current.clone()
    }

    /// Number of publishes applied since construction.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a `SessionState` subscription.
///
/// Dropping the handle unsubscribes it.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<AuthState>,
    state: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next state in publish order.
    ///
    /// Returns `None` once the `SessionState` has been dropped and every
    /// queued state has been read.
    pub async fn recv(&mut self) -> Option<AuthState> {
        self.rx.recv().await
    }

    /// Next queued state, without waiting.
    pub fn try_recv(&mut self) -> Option<AuthState> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.state.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
