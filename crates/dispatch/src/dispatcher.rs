//! Single outbound call with a pool-selected credential
//!
//! One `dispatch` is: select a usable credential, POST once to the Messages
//! API, classify the response, feed the response headers back into the pool.
//! No retries happen here; exhaustion is reported to the caller as
//! `CredentialsExhausted` and the retry orchestrator decides what to do.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claude_api::{
    API_KEY_HEADER, MESSAGES_PATH, MessagesRequest, Outcome, VERSION_HEADER, classify,
};
use credential_pool::{CredentialPool, SelectedCredential};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use tracing::{debug, warn};

use crate::Dispatch;
use crate::error::{Error, Result};

/// One generation request: a single user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// `None` means there is nothing to send; dispatch yields `Empty`
    pub message: Option<String>,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Request {
    pub fn new(message: Option<String>, max_tokens: u32, system_prompt: impl Into<String>) -> Self {
        Self {
            message,
            max_tokens,
            system_prompt: system_prompt.into(),
        }
    }
}

/// A classified response paired with the credential that produced it.
#[derive(Debug)]
pub struct Exchange {
    pub credential: SelectedCredential,
    /// Response headers; `None` when no response was received
    pub headers: Option<HeaderMap>,
    pub outcome: Outcome,
}

/// Upstream settings for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub base_url: String,
    pub model: String,
    pub api_version: String,
    /// Per-call HTTP timeout
    pub timeout: Duration,
}

/// Issues Messages API calls using credentials from a shared pool.
pub struct Dispatcher {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_version: String,
    timeout: Duration,
    pool: Arc<CredentialPool>,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, pool: Arc<CredentialPool>, config: DispatcherConfig) -> Self {
        Self {
            client,
            endpoint: format!("{}{MESSAGES_PATH}", config.base_url.trim_end_matches('/')),
            model: config.model,
            api_version: config.api_version,
            timeout: config.timeout,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Dispatch `request` using the current wall-clock time.
    pub async fn dispatch_now(&self, request: &Request) -> Result<Outcome> {
        self.dispatch_at(request, Utc::now()).await
    }

    /// Dispatch `request`, judging credential usability at `now`.
    ///
    /// The same instant is used for selection and for evaluating the state
    /// learned from the response, so a throttled response without a reset
    /// time still counts as exhaustion for this call.
    pub async fn dispatch_at(&self, request: &Request, now: DateTime<Utc>) -> Result<Outcome> {
        let Some(message) = request.message.as_deref() else {
            debug!("request has no message, skipping dispatch");
            return Ok(Outcome::Empty);
        };

        let credential = self.pool.select_usable_at(now).inspect_err(|err| {
            if matches!(err, credential_pool::Error::Exhausted(_)) {
                metrics::counter!("claude_credential_exhausted_total").increment(1);
            }
        })?;

        let exchange = self.send(credential, message, request).await?;
        self.settle(exchange, now)
    }

    /// Issue the HTTP call and classify whatever comes back.
    async fn send(
        &self,
        credential: SelectedCredential,
        message: &str,
        request: &Request,
    ) -> Result<Exchange> {
        let mut api_key = HeaderValue::from_str(credential.key.expose()).map_err(|_| {
            Error::Internal(format!(
                "{} is not a valid header value",
                credential.label
            ))
        })?;
        api_key.set_sensitive(true);
        let version = HeaderValue::from_str(&self.api_version)
            .map_err(|e| Error::Internal(format!("invalid api version header: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, api_key);
        headers.insert(VERSION_HEADER, version);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let body = MessagesRequest::single_turn(
            self.model.as_str(),
            message,
            request.max_tokens,
            request.system_prompt.as_str(),
        );

        let response = match self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    credential = %credential.label,
                    error = %e,
                    timeout = e.is_timeout(),
                    "upstream call failed without a response"
                );
                return Ok(Exchange {
                    credential,
                    headers: None,
                    outcome: Outcome::Empty,
                });
            }
        };

        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(credential = %credential.label, status, error = %e, "failed to read upstream body");
                Default::default()
            }
        };

        let outcome = classify(status, &body);
        debug!(credential = %credential.label, status, outcome = outcome.label(), "upstream call classified");

        Ok(Exchange {
            credential,
            headers: Some(response_headers),
            outcome,
        })
    }

    /// Feed the exchange back into the pool and decide the call's result.
    fn settle(&self, exchange: Exchange, now: DateTime<Utc>) -> Result<Outcome> {
        let Exchange {
            credential,
            headers,
            outcome,
        } = exchange;

        record_outcome(&outcome);

        if let Outcome::UpstreamFailure {
            error_type,
            message,
        } = &outcome
        {
            warn!(credential = %credential.label, error_type = %error_type, message = %message, "upstream failure");
            return Ok(outcome);
        }

        let Some(headers) = headers else {
            return Ok(outcome);
        };

        let Some(state) = self
            .pool
            .record_usage_at(credential.key.expose(), &headers, now)
        else {
            return Ok(outcome);
        };

        if state.is_usable_at(now) {
            return Ok(outcome);
        }

        metrics::counter!("claude_credential_exhausted_total").increment(1);
        let retry_after = match state {
            credential_pool::CredentialState::Expired { retry_after } => retry_after.to_rfc3339(),
            _ => now.to_rfc3339(),
        };
        warn!(
            credential = %credential.label,
            outcome = outcome.label(),
            retry_after = %retry_after,
            "credential exhausted by upstream"
        );
        Err(Error::CredentialsExhausted(format!(
            "{} throttled until {retry_after}",
            credential.label
        )))
    }
}

impl Dispatch for Dispatcher {
    fn dispatch<'a>(
        &'a self,
        request: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>> {
        Box::pin(self.dispatch_now(request))
    }
}

fn record_outcome(outcome: &Outcome) {
    metrics::counter!("claude_calls_total", "outcome" => outcome.label()).increment(1);
}
