//! Server-Sent Events scanning for streamed completions.
//!
//! OpenAI-style streams look like:
//! ```text
//! data: {"id":"chatcmpl-123","choices":[{"delta":{"content":"Hello"}}]}
//!
//! data: {"id":"chatcmpl-123","choices":[{"delta":{"content":" world"}}]}
//!
//! data: [DONE]
//! ```
//!
//! The scanner watches a stream that is forwarded untouched: it reassembles
//! lines split across network chunks, accumulates delta text and keeps the
//! last usage object a backend reports.

use serde_json::Value;

use crate::relay::request::Usage;

/// SSE event types
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Data event with JSON payload
    Data(Value),
    /// Stream complete marker
    Done,
    /// Comment or keep-alive
    Comment(String),
    /// Unparsable data or explicit error line
    Error(String),
}

/// Parse an SSE line into an event
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();

    if line.is_empty() {
        return None;
    }

    if let Some(comment) = line.strip_prefix(':') {
        return Some(SseEvent::Comment(comment.trim().to_string()));
    }

    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim_start();
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }

        match serde_json::from_str(data) {
            Ok(json) => Some(SseEvent::Data(json)),
            Err(_) => Some(SseEvent::Error(format!("Invalid JSON: {data}"))),
        }
    } else if let Some(error) = line.strip_prefix("error:") {
        Some(SseEvent::Error(error.trim().to_string()))
    } else {
        None
    }
}

/// Incremental observer of an SSE byte stream.
#[derive(Debug, Default)]
pub struct SseScanner {
    /// Bytes of an incomplete trailing line
    pending: Vec<u8>,
    /// Concatenated delta content
    content: String,
    /// Last usage object seen
    usage: Option<Usage>,
    /// First error event or embedded error message
    error: Option<String>,
    /// Data events seen
    events: usize,
    done: bool,
}

impl SseScanner {
    /// Create a new scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a raw chunk (may hold several events or part of one)
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.observe_line(&String::from_utf8_lossy(&line));
        }
    }

    /// Flush a trailing line that had no newline
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.observe_line(&String::from_utf8_lossy(&line));
        }
    }

    fn observe_line(&mut self, line: &str) {
        match parse_sse_line(line) {
            Some(SseEvent::Data(json)) => {
                self.events += 1;
                self.observe_data(&json);
            },
            Some(SseEvent::Done) => self.done = true,
            Some(SseEvent::Error(e)) => {
                tracing::debug!("Unreadable stream line: {}", e);
                if line.trim_start().starts_with("error:") {
                    self.error.get_or_insert(e);
                }
            },
            Some(SseEvent::Comment(_)) | None => {},
        }
    }

    fn observe_data(&mut self, json: &Value) {
        if let Some(choices) = json.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(text) = choice
                    .get("delta")
                    .and_then(|delta| delta.get("content"))
                    .and_then(Value::as_str)
                {
                    self.content.push_str(text);
                } else if let Some(text) = choice.get("text").and_then(Value::as_str) {
                    // completions-mode streams
                    self.content.push_str(text);
                }
            }
        }

        if let Some(usage) = json.get("usage").filter(|usage| !usage.is_null()) {
            if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
                self.usage = Some(usage);
            }
        }

        if let Some(message) = json
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            self.error.get_or_insert_with(|| message.to_string());
        }
    }

    /// Delta content accumulated so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Usage reported in the stream, if any
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Error reported inside the stream, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of data events observed
    pub fn events(&self) -> usize {
        self.events
    }

    /// Whether the `[DONE]` terminator was seen
    pub fn is_done(&self) -> bool {
        self.done
    }
}
