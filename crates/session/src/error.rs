//! Error types for session operations

/// Errors from login/logout/restore.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential store error: {0}")]
    Store(#[from] credential::Error),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome shared by every waiter of one refresh.
///
/// `Clone` because a single issuer result is handed to all queued callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// The issuer refused the refresh secret. The session is over.
    #[error("refresh denied: {0}")]
    Denied(String),

    /// The issuer could not be reached or failed for unrelated reasons.
    #[error("refresh transport failure: {0}")]
    Transport(String),

    /// Nothing to refresh: no login was performed, or the session ended.
    #[error("no credential available")]
    NoCredential,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_error_display_carries_reason() {
        assert_eq!(
            RefreshError::Denied("invalid_grant".into()).to_string(),
            "refresh denied: invalid_grant"
        );
        assert_eq!(
            RefreshError::NoCredential.to_string(),
            "no credential available"
        );
    }

    #[test]
    fn store_error_converts() {
        let err: Error = credential::Error::Io("disk full".into()).into();
        assert!(err.to_string().contains("disk full"));
    }
}
