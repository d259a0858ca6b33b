//! Credential-aware dispatch of Messages API calls
//!
//! Three layers, each wrapping the one below:
//! - `Dispatcher`: one outbound call with a pool-selected credential; learns
//!   the credential's rate-limit state from the response headers
//! - `RetryOrchestrator`: retries calls that failed with
//!   `CredentialsExhausted`, with capped exponential backoff and jitter
//! - `BatchCoordinator`: fans a batch of independent requests out through the
//!   orchestrator and folds the results into a single reply
//!
//! The `Dispatch` trait is the seam between the layers, so the retry and batch
//! logic can be driven by scripted dispatchers in tests.

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod retry;

pub use batch::{BatchCoordinator, BatchReply, BatchResult};
pub use dispatcher::{Dispatcher, DispatcherConfig, Exchange, Request};
pub use error::{Error, Result};
pub use retry::{RetryAction, RetryEvent, RetryOrchestrator, RetryPolicy, RetryState};

use claude_api::Outcome;
use std::future::Future;
use std::pin::Pin;

/// Anything that can turn a `Request` into a classified `Outcome`.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Dispatch>`).
pub trait Dispatch: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>>;
}

impl<D: Dispatch + ?Sized> Dispatch for std::sync::Arc<D> {
    fn dispatch<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>> {
        (**self).dispatch(request)
    }
}
