//! Assistant text reconstruction from captured response bodies.
//!
//! Used for audit logging only. Extraction never fails: structural problems
//! degrade to a [`Placeholder`] naming the expectation that was not met.

use std::fmt;

use serde_json::Value;

use super::tap::CapturedResponse;

/// Server-sent-event data marker.
const DATA_MARKER: &str = "data: ";

/// Stream terminator frame.
const DONE_SENTINEL: &str = "[DONE]";

/// Diagnostic text substituted when a body has no extractable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// Nothing was captured.
    EmptyBody,
    /// Body is not JSON.
    UnparsableJson,
    /// `choices` missing, not an array, or empty.
    NoChoices,
    /// First choice is not an object.
    MalformedChoice,
    /// Choice has no `message` object.
    MalformedMessage,
    /// Message has no string `content`.
    MissingContent,
}

impl Placeholder {
    /// Text logged in place of content.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyBody => "Empty response body",
            Self::UnparsableJson => "Failed to parse response JSON",
            Self::NoChoices => "No content found in response",
            Self::MalformedChoice => "Invalid choice format in response",
            Self::MalformedMessage => "Invalid message format in response",
            Self::MissingContent => "No content field found in message",
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconstruct the assistant text of a captured response.
pub fn extract(captured: &CapturedResponse) -> String {
    if captured.is_empty() {
        return Placeholder::EmptyBody.to_string();
    }

    let text = captured.text();
    if captured.is_stream {
        extract_stream(&text)
    } else {
        extract_non_stream(&text)
    }
}

/// First choice's `message.content` of a single JSON document.
pub fn extract_non_stream(body: &str) -> String {
    match first_message_content(body) {
        Ok(content) => content,
        Err(placeholder) => placeholder.to_string(),
    }
}

fn first_message_content(body: &str) -> Result<String, Placeholder> {
    let document: Value = serde_json::from_str(body).map_err(|_| Placeholder::UnparsableJson)?;

    let choice = document
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or(Placeholder::NoChoices)?;

    let message = choice
        .as_object()
        .ok_or(Placeholder::MalformedChoice)?
        .get("message")
        .and_then(Value::as_object)
        .ok_or(Placeholder::MalformedMessage)?;

    message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(Placeholder::MissingContent)
}

/// Concatenated `delta.content` of every choice of every frame.
///
/// Frames that are blank, the terminator, or not JSON contribute nothing.
pub fn extract_stream(body: &str) -> String {
    let mut combined = String::new();
    for frame in body.split(DATA_MARKER) {
        if let Some(fragment) = frame_text(frame) {
            combined.push_str(&fragment);
        }
    }
    combined
}

/// Delta text carried by one frame, if any.
pub fn frame_text(frame: &str) -> Option<String> {
    let frame = frame.trim();
    if frame.is_empty() || frame == DONE_SENTINEL {
        return None;
    }

    let document: Value = serde_json::from_str(frame).ok()?;
    let choices = document.get("choices")?.as_array()?;

    let text: String = choices
        .iter()
        .filter_map(|choice| choice.get("delta")?.get("content")?.as_str())
        .collect();

    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn captured(body: &'static str, is_stream: bool) -> CapturedResponse {
        CapturedResponse {
            body: Bytes::from_static(body.as_bytes()),
            is_stream,
        }
    }

    #[test]
    fn test_stream_frames_concatenate() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                    data: [DONE]\n\n";
        assert_eq!(extract(&captured(body, true)), "Hello");
    }

    #[test]
    fn test_stream_skips_garbage_and_role_frames() {
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                    data: {not json\n\n\
                    data: {\"choices\":[]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"a\"}},{\"delta\":{\"content\":\"b\"}}]}\n\n\
                    data: [DONE]";
        assert_eq!(extract_stream(body), "ab");
    }

    #[test]
    fn test_stream_without_frames_is_empty() {
        assert_eq!(extract_stream(": keep-alive\n\n"), "");
    }

    #[test]
    fn test_non_stream_content() {
        let body = r#"{"choices":[{"message":{"content":"ok"}}]}"#;
        assert_eq!(extract(&captured(body, false)), "ok");
    }

    #[test]
    fn test_non_stream_placeholders() {
        let cases = [
            ("{oops", Placeholder::UnparsableJson),
            (r#"{"choices":[]}"#, Placeholder::NoChoices),
            (r#"{"id":"x"}"#, Placeholder::NoChoices),
            (r#"{"choices":["text"]}"#, Placeholder::MalformedChoice),
            (r#"{"choices":[{"text":"hi"}]}"#, Placeholder::MalformedMessage),
            (r#"{"choices":[{"message":{"role":"assistant"}}]}"#, Placeholder::MissingContent),
            (r#"{"choices":[{"message":{"content":null}}]}"#, Placeholder::MissingContent),
        ];

        for (body, expected) in cases {
            assert_eq!(extract_non_stream(body), expected.as_str(), "body: {body}");
        }
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(extract(&captured("", false)), Placeholder::EmptyBody.as_str());
        assert_eq!(extract(&captured("", true)), Placeholder::EmptyBody.as_str());
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let response = captured(r#"{"choices":[{"message":{"content":"same"}}]}"#, false);
        assert_eq!(extract(&response), extract(&response));

        let broken = captured("]]", false);
        assert_eq!(extract(&broken), extract(&broken));
        assert_eq!(extract(&broken), Placeholder::UnparsableJson.as_str());
    }
}
