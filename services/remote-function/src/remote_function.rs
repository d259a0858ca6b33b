//! BigQuery remote function envelope
//!
//! BigQuery posts `{requestId, caller, sessionUser, userDefinedContext, calls}`
//! where each entry of `calls` holds one row's arguments. The first argument
//! is the message text; `userDefinedContext` carries `max-tokens` and
//! `system-prompt`, applied to every row. The reply is either
//! `{"replies": [...]}` with one entry per row or `{"errorMessage": "..."}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use claude_api::MessagesResponse;
use dispatch::{BatchCoordinator, BatchReply, Dispatcher, Request};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::service::ServiceMetrics;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
const MAX_TOKENS_KEY: &str = "max-tokens";
const SYSTEM_PROMPT_KEY: &str = "system-prompt";

/// Inbound request from BigQuery.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFunctionRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub session_user: Option<String>,
    #[serde(default)]
    pub user_defined_context: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub calls: Option<Vec<Vec<Value>>>,
}

impl RemoteFunctionRequest {
    /// `max-tokens` from the context, as a string or a number.
    pub fn max_tokens(&self) -> Result<u32> {
        let Some(raw) = self.context(MAX_TOKENS_KEY) else {
            return Ok(DEFAULT_MAX_TOKENS);
        };
        let parsed = match raw {
            Value::String(s) => s.trim().parse::<u32>().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        match parsed {
            Some(n) if n > 0 => Ok(n),
            _ => Err(Error::InvalidMaxTokens(raw.to_string())),
        }
    }

    pub fn system_prompt(&self) -> String {
        match self.context(SYSTEM_PROMPT_KEY) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// One dispatch request per row, in row order.
    pub fn requests(&self) -> Result<Vec<Request>> {
        let max_tokens = self.max_tokens()?;
        let system_prompt = self.system_prompt();
        Ok(self
            .calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|args| Request::new(message(args), max_tokens, system_prompt.clone()))
            .collect())
    }

    fn context(&self, key: &str) -> Option<&Value> {
        self.user_defined_context.as_ref()?.get(key)
    }
}

/// First argument of a row; SQL NULL or a missing argument means no message.
fn message(args: &[Value]) -> Option<String> {
    match args.first()? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Reply to BigQuery: exactly one of the two fields.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum RemoteFunctionResponse {
    Replies {
        replies: Vec<MessagesResponse>,
    },
    Error {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl From<BatchReply> for RemoteFunctionResponse {
    fn from(reply: BatchReply) -> Self {
        match reply {
            BatchReply::Replies(replies) => RemoteFunctionResponse::Replies { replies },
            BatchReply::Error(error_message) => RemoteFunctionResponse::Error { error_message },
        }
    }
}

fn json_response(status: StatusCode, body: &RemoteFunctionResponse) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::to_string(body).unwrap_or_else(|e| {
            format!(r#"{{"errorMessage":"failed to encode reply: {e}"}}"#)
        }),
    )
        .into_response()
}

/// Shared state for the remote function handler
#[derive(Clone)]
pub struct FunctionState {
    pub coordinator: Arc<BatchCoordinator<Dispatcher>>,
    pub metrics: ServiceMetrics,
}

/// Decrements the in-flight counter when the request finishes or is dropped.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run one BigQuery batch and build the reply.
///
/// Per-row failures come back as `errorMessage` with status 200 so BigQuery
/// surfaces the text; only a malformed envelope gets a 400.
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn handle(
    state: &FunctionState,
    body: &[u8],
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.metrics.in_flight);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let requests = match serde_json::from_slice::<RemoteFunctionRequest>(body)
        .map_err(|e| Error::InvalidBody(e.to_string()))
        .and_then(|envelope| {
            info!(
                bq_request_id = envelope.request_id.as_deref().unwrap_or(""),
                caller = envelope.caller.as_deref().unwrap_or(""),
                session_user = envelope.session_user.as_deref().unwrap_or(""),
                calls = envelope.calls.as_ref().map_or(0, Vec::len),
                "remote function request received"
            );
            envelope.requests()
        }) {
        Ok(requests) => requests,
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "rejecting remote function request");
            metrics::record_request("rejected", started.elapsed().as_secs_f64());
            return json_response(
                StatusCode::BAD_REQUEST,
                &RemoteFunctionResponse::Error {
                    error_message: e.to_string(),
                },
            );
        }
    };

    let batch = state.coordinator.run(&requests).await;
    let reply = RemoteFunctionResponse::from(batch.into_reply());

    let status = match &reply {
        RemoteFunctionResponse::Replies { replies } => {
            info!(replies = replies.len(), "remote function request completed");
            "ok"
        }
        RemoteFunctionResponse::Error { .. } => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            "error"
        }
    };
    metrics::record_request(status, started.elapsed().as_secs_f64());

    json_response(StatusCode::OK, &reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: Value) -> RemoteFunctionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn defaults_apply_without_context() {
        let request = envelope(serde_json::json!({"calls": [["hello"]]}));
        assert_eq!(request.max_tokens(), Ok(1024));
        assert_eq!(request.system_prompt(), "");
        assert_eq!(
            request.requests().unwrap(),
            vec![Request::new(Some("hello".into()), 1024, "")]
        );
    }

    #[test]
    fn context_applies_to_every_call() {
        let request = envelope(serde_json::json!({
            "requestId": "124ab1c",
            "caller": "//bigquery.googleapis.com/projects/p/jobs/j",
            "sessionUser": "user@example.com",
            "userDefinedContext": {"max-tokens": "256", "system-prompt": "Answer in French."},
            "calls": [["one"], ["two"]]
        }));
        let requests = request.requests().unwrap();
        assert_eq!(requests.len(), 2);
        for r in &requests {
            assert_eq!(r.max_tokens, 256);
            assert_eq!(r.system_prompt, "Answer in French.");
        }
        assert_eq!(requests[1].message.as_deref(), Some("two"));
    }

    #[test]
    fn numeric_max_tokens_is_accepted() {
        let request = envelope(serde_json::json!({"userDefinedContext": {"max-tokens": 64}}));
        assert_eq!(request.max_tokens(), Ok(64));
    }

    #[test]
    fn invalid_max_tokens_is_rejected() {
        for bad in [
            serde_json::json!("lots"),
            serde_json::json!("0"),
            serde_json::json!(-5),
            serde_json::json!(1.5),
            serde_json::json!(true),
        ] {
            let request = envelope(serde_json::json!({"userDefinedContext": {"max-tokens": bad}}));
            assert!(
                matches!(request.requests(), Err(Error::InvalidMaxTokens(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn missing_calls_is_an_empty_batch() {
        let request = envelope(serde_json::json!({"requestId": "x"}));
        assert!(request.requests().unwrap().is_empty());
    }

    #[test]
    fn empty_or_null_arguments_have_no_message() {
        let request = envelope(serde_json::json!({"calls": [[], [null], ["hi", "extra"], [42]]}));
        let messages: Vec<Option<String>> =
            request.requests().unwrap().into_iter().map(|r| r.message).collect();
        assert_eq!(
            messages,
            vec![None, None, Some("hi".into()), Some("42".into())]
        );
    }

    #[test]
    fn response_serializes_exactly_one_field() {
        let error = RemoteFunctionResponse::Error {
            error_message: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::json!({"errorMessage": "boom"})
        );

        let replies = RemoteFunctionResponse::Replies { replies: vec![] };
        assert_eq!(
            serde_json::to_value(&replies).unwrap(),
            serde_json::json!({"replies": []})
        );
    }
}
