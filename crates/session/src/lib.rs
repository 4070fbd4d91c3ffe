//! Session state broadcast and coordinated credential refresh
//!
//! Owns the policy around the single credential held by `credential::TokenStore`:
//! who may change it, how observers learn about changes, and how concurrent
//! callers share one refresh. The session publishes every change to
//! `SessionState` subscribers and reads from the store only.
//!
//! Session lifecycle:
//! 1. `SessionControl::login()` stores a credential, publishes `Authenticated`
//! 2. A caller finds the credential stale and calls
//!    `RefreshCoordinator::ensure_fresh()` → one refresh, `Expired` published
//! 3. Issuer returns a new credential → stored, `Authenticated` published,
//!    every waiter resolved with it
//! 4. Issuer rejects the refresh secret → store cleared, `RefreshFailed`
//!    published, every waiter rejected
//! 5. `SessionControl::logout()` clears the store, publishes `Unauthenticated`
//! 6. Background task refreshes proactively before expiration

pub mod control;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod refresh;
pub mod state;

pub use control::SessionControl;
pub use coordinator::{DEFAULT_REFRESH_TIMEOUT, RefreshCoordinator};
pub use error::{Error, RefreshError, Result};
pub use guard::{Access, AccessGuard, DenyReason};
pub use refresh::{refresh_cycle, spawn_refresh_task};
pub use state::{AuthState, SessionState, Subscription};
