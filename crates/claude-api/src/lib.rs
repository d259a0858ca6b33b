//! Anthropic Messages API surface used by the gateway
//!
//! Holds the wire types for the single endpoint the gateway calls
//! (`POST /v1/messages`), the header names the rate-limit logic reads, and the
//! pure response classifier that turns an HTTP status and body into an
//! [`Outcome`]. No I/O happens here; the dispatch crate owns the HTTP client.

pub mod constants;
pub mod messages;
pub mod outcome;

pub use constants::*;
pub use messages::{
    ContentBlock, ErrorBody, ErrorDetail, Message, MessagesRequest, MessagesResponse, Role, Usage,
};
pub use outcome::{Outcome, classify};
