//! Types shared by the remote-function gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
