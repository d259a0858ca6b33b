//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No credential is usable right now; retrying later may succeed.
    #[error("credentials exhausted: {0}")]
    Exhausted(String),

    /// The pool was built without any credentials.
    #[error("credential pool is empty")]
    Empty,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
