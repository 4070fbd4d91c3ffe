//! Common types shared by the session crates and the proxy service

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
