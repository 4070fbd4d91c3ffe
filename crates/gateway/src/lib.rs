//! Outbound calls with the session credential attached
//!
//! `RequestGateway` is the only place that decides to retry a call: a
//! credential rejected by the remote side triggers one coordinated refresh
//! and exactly one more attempt. The `http` module adapts reqwest round trips
//! to that contract.
//!
//! Call flow:
//! 1. Read the stored credential; refresh first if it is missing or stale
//! 2. Invoke the call with the credential attached
//! 3. `CallError::Unauthorized` → `RefreshCoordinator::ensure_fresh()` and
//!    one more invocation
//! 4. A second rejection, a denied refresh or a transport failure is returned
//!    as `Error`

pub mod error;
pub mod gateway;
pub mod http;

pub use error::{CallError, Error, Result};
pub use gateway::{DEFAULT_EXPIRY_LEEWAY, GatewayConfig, RequestGateway};
pub use http::{StatusClass, authorize, classify_status, send};
