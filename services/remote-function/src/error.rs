//! Service-specific error types

use thiserror::Error;

/// Envelope errors that reject a request before anything is dispatched.
///
/// Per-call failures never show up here; they are folded into the batch
/// reply's `errorMessage`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("max-tokens must be a positive integer, got: {0}")]
    InvalidMaxTokens(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
