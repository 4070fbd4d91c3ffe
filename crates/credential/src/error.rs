//! Error types for credential storage and token issuance

/// Errors from credential operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the issuer refused the presented secret outright.
    ///
    /// Only this variant means the refresh secret is unusable; every other
    /// variant may succeed on a later attempt.
    pub fn is_denied(&self) -> bool {
        matches!(self, Error::InvalidCredentials(_))
    }
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
