//! Request and response bodies for `POST /v1/messages`
//!
//! Response types default the metadata fields (`id`, `model`, `type`, `usage`)
//! so a success body is recognised by its `content` array alone. Error bodies
//! must carry the nested `error` object to count as parseable.

use serde::{Deserialize, Serialize};

use crate::constants::TEMPERATURE;

/// Conversation role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Outbound request body.
///
/// Every call is a single user turn; `temperature`, `stream` and
/// `stop_sequences` are fixed.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    pub system: String,
    pub temperature: f64,
    pub stream: bool,
    pub stop_sequences: Vec<String>,
}

impl MessagesRequest {
    pub fn single_turn(
        model: impl Into<String>,
        message: impl Into<String>,
        max_tokens: u32,
        system: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            messages: vec![Message {
                role: Role::User,
                content: message.into(),
            }],
            system: system.into(),
            temperature: TEMPERATURE,
            stream: false,
            stop_sequences: Vec::new(),
        }
    }
}

/// A content block in a success response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type", default = "text_block_type")]
    pub block_type: String,
}

fn text_block_type() -> String {
    "text".to_string()
}

/// Token accounting reported by the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Success body (HTTP 200).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(rename = "type", default)]
    pub response_type: String,
    #[serde(default)]
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect()
    }
}

/// Inner error object of an error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Error body (any non-200, non-429 status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type", default)]
    pub body_type: String,
    pub error: ErrorDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_fixed_fields() {
        let request = MessagesRequest::single_turn(
            "claude-3-5-sonnet-20240620",
            "Summarize this row",
            256,
            "Be brief.",
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "claude-3-5-sonnet-20240620");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Summarize this row");
        assert_eq!(json["system"], "Be brief.");
        assert_eq!(json["temperature"], 1.0);
        assert_eq!(json["stream"], false);
        assert_eq!(json["stop_sequences"], serde_json::json!([]));
    }

    #[test]
    fn full_success_body_deserializes() {
        let body = r#"{
            "content": [{"text": "hi", "type": "text"}],
            "id": "msg_01",
            "model": "claude-3-5-sonnet-20240620",
            "role": "assistant",
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "type": "message",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }"#;
        let response: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.text(), "hi");
        assert_eq!(response.id, "msg_01");
        assert_eq!(response.role, Role::Assistant);
        assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage.output_tokens, 3);
    }

    #[test]
    fn minimal_success_body_deserializes() {
        let response: MessagesResponse =
            serde_json::from_str(r#"{"content":[{"text":"hi"}]}"#).unwrap();
        assert_eq!(response.content[0].block_type, "text");
        assert_eq!(response.usage, Usage::default());
    }

    #[test]
    fn success_body_without_content_is_rejected() {
        assert!(serde_json::from_str::<MessagesResponse>(r#"{"id":"msg_01"}"#).is_err());
    }

    #[test]
    fn error_body_deserializes() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens: too large"}}"#;
        let error: ErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(error.body_type, "error");
        assert_eq!(error.error.error_type, "invalid_request_error");
        assert_eq!(error.error.message, "max_tokens: too large");
    }

    #[test]
    fn text_skips_non_text_blocks() {
        let response: MessagesResponse = serde_json::from_str(
            r#"{"content":[{"text":"a","type":"text"},{"type":"tool_use"},{"text":"b","type":"text"}]}"#,
        )
        .unwrap();
        assert_eq!(response.text(), "ab");
    }
}
