//! Canonical request and response shapes.
//!
//! [`CanonicalRequest`] is the backend-agnostic form every inbound call is
//! parsed into. Fields the relay does not interpret are kept in `extra` so a
//! re-serialized request loses nothing the client sent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Generic completion request (chat, completion, embedding, moderation, edit).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    /// Model name; rewritten once by model mapping.
    #[serde(default)]
    pub model: String,

    /// Chat messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,

    /// Completion prompt: a string or an array of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,

    /// Embedding/moderation input: a string or an array of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Edit instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,

    /// Stream the response as server-sent events.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,

    /// Maximum completion tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,

    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Number of choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,

    /// Frequency penalty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,

    /// Presence penalty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,

    /// Stop sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,

    /// End-user identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Fields not interpreted by the relay (tools, response_format, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalRequest {
    /// Requested completion budget, zero when unset.
    pub fn max_tokens_or_zero(&self) -> i64 {
        self.max_tokens.unwrap_or(0)
    }
}

/// One chat message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Speaker role.
    #[serde(default)]
    pub role: String,

    /// Text or multi-part content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    /// Optional participant name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// tool_calls, tool_call_id and friends.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Message content: plain text or an array of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content.
    Text(String),
    /// Multi-modal parts.
    Parts(Vec<ContentPart>),
}

/// A typed content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// `text`, `image_url`, ...
    #[serde(rename = "type")]
    pub part_type: String,

    /// Text of a `text` part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Everything else (image_url, input_audio, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Strings carried by a prompt/input value.
///
/// Accepts a bare string or an array of strings; other array elements
/// (token arrays) are ignored.
pub fn text_inputs(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Whether a prompt/input value carries anything.
pub fn is_empty_input(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

/// Token usage reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: i64,
    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: i64,
    /// Prompt + completion.
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    /// Build with a consistent total.
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Whether the backend reported nothing usable.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi", "tool_call_id": "x"}],
            "tools": [{"type": "function"}],
            "response_format": {"type": "json_object"}
        });

        let req: CanonicalRequest = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(req.extra.len(), 2);

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_multipart_content() {
        let raw = json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this?"},
                {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
            ]
        });

        let msg: Message = serde_json::from_value(raw).unwrap();
        match msg.content {
            Some(MessageContent::Parts(parts)) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0].text.as_deref(), Some("what is this?"));
                assert!(parts[1].extra.contains_key("image_url"));
            },
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn test_text_inputs() {
        assert_eq!(text_inputs(&json!("abc")), vec!["abc"]);
        assert_eq!(text_inputs(&json!(["a", "b", 3])), vec!["a", "b"]);
        assert!(text_inputs(&json!({"x": 1})).is_empty());

        assert!(is_empty_input(None));
        assert!(is_empty_input(Some(&json!(""))));
        assert!(is_empty_input(Some(&json!([]))));
        assert!(!is_empty_input(Some(&json!(["a"]))));
    }

    #[test]
    fn test_usage_new() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
        assert!(!usage.is_empty());
        assert!(Usage::default().is_empty());
    }
}
