//! Response classification
//!
//! Maps an HTTP status and raw body to exactly one [`Outcome`]. 429 always
//! means `RateLimited` whatever the body says; whether that throttling exhausts
//! the credential is decided from headers by the pool, not here.

use std::fmt;

use crate::messages::{ErrorBody, MessagesResponse};

/// Classified result of one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(MessagesResponse),
    RateLimited,
    UpstreamFailure { error_type: String, message: String },
    /// Missing or unparseable body
    Empty,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::UpstreamFailure { .. } => "upstream_failure",
            Outcome::Empty => "empty",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(response) => write!(
                f,
                "success (stop_reason: {})",
                response.stop_reason.as_deref().unwrap_or("none")
            ),
            Outcome::RateLimited => write!(f, "rate limited"),
            Outcome::UpstreamFailure {
                error_type,
                message,
            } => write!(f, "upstream failure ({error_type}): {message}"),
            Outcome::Empty => write!(f, "empty response"),
        }
    }
}

/// Classify an upstream response by HTTP status and body.
pub fn classify(status: u16, body: &[u8]) -> Outcome {
    match status {
        429 => Outcome::RateLimited,
        200 => match serde_json::from_slice::<MessagesResponse>(body) {
            Ok(response) => Outcome::Success(response),
            Err(_) => Outcome::Empty,
        },
        _ => match serde_json::from_slice::<ErrorBody>(body) {
            Ok(failed) => Outcome::UpstreamFailure {
                error_type: failed.error.error_type,
                message: failed.error.message,
            },
            Err(_) => Outcome::Empty,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUCCESS: &[u8] = br#"{"content":[{"text":"hi","type":"text"}],"id":"msg_01","model":"claude-3-5-sonnet-20240620","role":"assistant","stop_reason":"end_turn","stop_sequence":null,"type":"message","usage":{"input_tokens":5,"output_tokens":1}}"#;
    const ERROR: &[u8] =
        br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;

    #[test]
    fn ok_with_success_body_is_success() {
        match classify(200, SUCCESS) {
            Outcome::Success(response) => assert_eq!(response.text(), "hi"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn ok_with_garbage_is_empty() {
        assert_eq!(classify(200, b"<html>oops</html>"), Outcome::Empty);
        assert_eq!(classify(200, b""), Outcome::Empty);
    }

    #[test]
    fn ok_with_error_shaped_body_is_empty() {
        assert_eq!(classify(200, ERROR), Outcome::Empty);
    }

    #[test]
    fn too_many_requests_is_rate_limited_regardless_of_body() {
        assert_eq!(classify(429, b""), Outcome::RateLimited);
        assert_eq!(classify(429, ERROR), Outcome::RateLimited);
        assert_eq!(classify(429, SUCCESS), Outcome::RateLimited);
        assert_eq!(classify(429, b"not json"), Outcome::RateLimited);
    }

    #[test]
    fn other_status_with_error_body_is_upstream_failure() {
        assert_eq!(
            classify(529, ERROR),
            Outcome::UpstreamFailure {
                error_type: "overloaded_error".into(),
                message: "Overloaded".into(),
            }
        );
        assert!(matches!(
            classify(400, br#"{"error":{"type":"invalid_request_error","message":"bad"}}"#),
            Outcome::UpstreamFailure { .. }
        ));
    }

    #[test]
    fn other_status_without_parseable_body_is_empty() {
        assert_eq!(classify(500, b"internal server error"), Outcome::Empty);
        assert_eq!(classify(401, b""), Outcome::Empty);
    }

    #[test]
    fn classification_is_total_over_statuses() {
        let bodies: [&[u8]; 4] = [SUCCESS, ERROR, b"", b"{}"];
        for status in 100u16..600 {
            for body in bodies {
                let outcome = classify(status, body);
                if status == 429 {
                    assert_eq!(outcome, Outcome::RateLimited);
                }
                if status != 200 && status != 429 && body == SUCCESS {
                    assert_eq!(outcome, Outcome::Empty, "status {status}");
                }
            }
        }
    }

    #[test]
    fn labels_and_display() {
        assert_eq!(Outcome::RateLimited.label(), "rate_limited");
        assert_eq!(Outcome::Empty.to_string(), "empty response");
        let failure = Outcome::UpstreamFailure {
            error_type: "invalid_request_error".into(),
            message: "bad".into(),
        };
        assert_eq!(failure.to_string(), "upstream failure (invalid_request_error): bad");
        assert!(!failure.is_success());
    }
}
