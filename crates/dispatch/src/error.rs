//! Error types for dispatch operations

/// Errors surfaced by a dispatch attempt.
///
/// `CredentialsExhausted` is the only retryable variant; the retry
/// orchestrator inspects it and backs off. Everything else returns to the
/// caller on the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Every credential is throttled, or the one just used became throttled
    #[error("credentials exhausted: {0}")]
    CredentialsExhausted(String),

    /// Local fault that retrying cannot fix (empty pool, unencodable key)
    #[error("internal dispatch error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CredentialsExhausted(_))
    }
}

impl From<credential_pool::Error> for Error {
    fn from(err: credential_pool::Error) -> Self {
        match err {
            credential_pool::Error::Exhausted(summary) => Error::CredentialsExhausted(summary),
            credential_pool::Error::Empty => Error::Internal(err.to_string()),
        }
    }
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_maps_to_retryable_error() {
        let err: Error = credential_pool::Error::Exhausted("{}".into()).into();
        assert_eq!(err, Error::CredentialsExhausted("{}".into()));
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_pool_maps_to_internal_error() {
        let err: Error = credential_pool::Error::Empty.into();
        assert!(matches!(err, Error::Internal(_)));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "internal dispatch error: credential pool is empty");
    }
}
