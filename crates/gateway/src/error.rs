//! Error types for gateway calls

use session::RefreshError;

/// What a single outbound call reports back to the gateway.
///
/// Only `Unauthorized` makes the gateway refresh and retry. Everything the
/// remote side says that is not about the credential belongs in the call's
/// own `Ok` value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The remote side rejected the attached credential (HTTP 401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Network failure, timeout, or anything else unrelated to the credential.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Terminal outcome of `RequestGateway::execute`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The call was rejected again with a freshly refreshed credential.
    #[error("authorization rejected after refresh: {0}")]
    AuthorizationRejected(String),

    /// The issuer refused the refresh secret; the session has ended.
    #[error("refresh denied: {0}")]
    RefreshDenied(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// No session to attach: never logged in, logged out, or refresh failed.
    #[error("no credential available")]
    NoCredential,
}

impl Error {
    /// Outcome label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Error::AuthorizationRejected(_) => "rejected",
            Error::RefreshDenied(_) => "refresh_denied",
            Error::TransportFailure(_) => "transport",
            Error::NoCredential => "no_credential",
        }
    }
}

impl From<RefreshError> for Error {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Denied(reason) => Error::RefreshDenied(reason),
            RefreshError::Transport(reason) => Error::TransportFailure(reason),
            RefreshError::NoCredential => Error::NoCredential,
        }
    }
}

/// Result alias for gateway calls.
pub type Result<T> = std::result::Result<T, Error>;
