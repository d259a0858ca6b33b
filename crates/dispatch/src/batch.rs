//! Batch fan-out and aggregation
//!
//! Every request in a batch runs independently through the retry
//! orchestrator, at most `max_concurrency` at a time. Results keep input
//! order. The aggregate is partial-tolerant in what it reports: a batch
//! with any failure becomes a single error that describes every failed call
//! by index, followed by the replies of the calls that did succeed.

use std::fmt::Write as _;

use claude_api::{MessagesResponse, Outcome};
use futures_util::StreamExt;
use futures_util::stream;
use tracing::{debug, warn};

use crate::Dispatch;
use crate::dispatcher::Request;
use crate::error::Result;
use crate::retry::RetryOrchestrator;

/// Default number of calls of one batch in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

const ERROR_PREAMBLE: &str = "Errors occurred in the interaction with claude:";

/// Ordered per-call results of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    results: Vec<Result<Outcome>>,
}

/// Caller-facing verdict for a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchReply {
    /// Every call succeeded; payloads in input order
    Replies(Vec<MessagesResponse>),
    /// At least one call failed
    Error(String),
}

impl BatchResult {
    pub fn new(results: Vec<Result<Outcome>>) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &[Result<Outcome>] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Indices of calls that produced `Success`.
    pub fn succeeded(&self) -> Vec<usize> {
        self.indices(true)
    }

    /// Indices of calls that produced anything else.
    pub fn failed(&self) -> Vec<usize> {
        self.indices(false)
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(is_success)
    }

    /// Fold the results into a single reply.
    ///
    /// An empty batch yields an empty reply list.
    pub fn into_reply(self) -> BatchReply {
        if !self.is_success() {
            return BatchReply::Error(self.error_summary());
        }
        let replies = self
            .results
            .into_iter()
            .filter_map(|result| match result {
                Ok(Outcome::Success(response)) => Some(response),
                _ => None,
            })
            .collect();
        BatchReply::Replies(replies)
    }

    fn indices(&self, success: bool) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, result)| is_success(result) == success)
            .map(|(index, _)| index)
            .collect()
    }

    /// Failed calls first, then every succeeded call with its reply text.
    fn error_summary(&self) -> String {
        let mut summary = String::from(ERROR_PREAMBLE);
        for (index, result) in self.results.iter().enumerate() {
            let detail = match result {
                Ok(Outcome::Success(_)) => continue,
                Ok(outcome) => outcome.to_string(),
                Err(err) => err.to_string(),
            };
            let _ = write!(summary, "\ncalls[{index}]: {detail}");
        }
        for (index, result) in self.results.iter().enumerate() {
            if let Ok(outcome @ Outcome::Success(response)) = result {
                let _ = write!(summary, "\ncalls[{index}]: {outcome}: {}", response.text());
            }
        }
        let _ = write!(summary, "\nsucceeded calls: {:?}", self.succeeded());
        summary
    }
}

fn is_success(result: &Result<Outcome>) -> bool {
    matches!(result, Ok(outcome) if outcome.is_success())
}

/// Runs batches of requests through a retry orchestrator.
pub struct BatchCoordinator<D> {
    orchestrator: RetryOrchestrator<D>,
    max_concurrency: usize,
}

impl<D: Dispatch> BatchCoordinator<D> {
    pub fn new(orchestrator: RetryOrchestrator<D>, max_concurrency: usize) -> Self {
        Self {
            orchestrator,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn orchestrator(&self) -> &RetryOrchestrator<D> {
        &self.orchestrator
    }

    /// Run every request and collect results in input order.
    ///
    /// Always returns a `BatchResult`; failures, including exhaustion that
    /// outlived the retry budget, are carried inside it.
    pub async fn run(&self, requests: &[Request]) -> BatchResult {
        let calls: Vec<_> = requests.iter().map(|r| self.run_one(r)).collect();
        let results: Vec<Result<Outcome>> = stream::iter(calls)
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let batch = BatchResult::new(results);
        if batch.is_success() {
            debug!(calls = batch.len(), "batch completed");
        } else {
            warn!(
                calls = batch.len(),
                failed = batch.failed().len(),
                "batch completed with failures"
            );
        }
        batch
    }

    async fn run_one(&self, request: &Request) -> Result<Outcome> {
        if request.message.is_none() {
            return Ok(Outcome::Empty);
        }
        self.orchestrator.execute(request).await
    }
}
