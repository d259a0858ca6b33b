//! Credential pool for Anthropic API keys
//!
//! Holds the configured API keys with per-key rate-limit state and hands out a
//! usable key per outbound call. State is learned only from upstream response
//! headers and kept in memory for the life of the process.
//!
//! Credential lifecycle:
//! 1. Pool is built from the configured key list → every key `NotInitialized`
//! 2. `select_usable` picks keys round-robin, skipping ones still throttled
//! 3. Upstream response headers → `record_usage` installs `Valid` or `Expired`
//! 4. An `Expired` key becomes selectable again once its reset time has passed;
//!    the stored state is left as-is until the next response overwrites it

pub mod error;
pub mod headers;
pub mod pool;

pub use error::{Error, Result};
pub use headers::capture_state;
pub use pool::{CredentialPool, CredentialState, SelectedCredential};
