//! Credential model, storage and token issuance
//!
//! Holds the single credential an application uses for outbound calls and
//! the collaborators that produce it. This crate has no policy: it never
//! decides when to refresh and never notifies observers. The `session` crate
//! drives it.
//!
//! Credential flow:
//! 1. `TokenIssuer::login()` exchanges user secrets for a `Credential`
//! 2. `TokenStore::set()` replaces the held credential and writes it through
//!    to the `KeyValueStore` backend
//! 3. `TokenIssuer::refresh()` trades the refresh secret for a new credential
//! 4. `TokenStore::clear()` on logout or a denied refresh

pub mod credential;
pub mod error;
pub mod issuer;
pub mod kv;
pub mod store;

pub use credential::{Credential, now_millis};
pub use error::{Error, Result};
pub use issuer::{HttpTokenIssuer, TokenIssuer, TokenResponse};
pub use kv::{BoxFuture, FileKv, KeyValueStore, MemoryKv};
pub use store::TokenStore;
