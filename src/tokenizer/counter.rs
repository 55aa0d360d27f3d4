//! Token counting implementation.
//!
//! Uses tiktoken-rs for accurate BPE token counting with lazy-loaded encoders.
//! Chat requests are counted with the OpenAI message framing overhead so the
//! prompt estimate matches what the backend will bill.

use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use super::{Encoding, TokenCounter};
use crate::relay::request::text_inputs;
use crate::relay::{CanonicalRequest, Message, MessageContent, RelayMode};

// Lazy-loaded tokenizer instances (thread-safe singletons)
static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

/// Fixed cost of an image part (low-detail tile).
const IMAGE_PART_TOKENS: i64 = 85;

/// Tokens that prime every assistant reply.
const REPLY_PRIMING_TOKENS: i64 = 3;

/// Get the cl100k_base tokenizer (lazy-loaded)
fn get_cl100k() -> Option<&'static CoreBPE> {
    CL100K
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::error!("Failed to load cl100k_base tokenizer: {}", e);
                None
            },
        })
        .as_ref()
}

/// Get the o200k_base tokenizer (lazy-loaded)
fn get_o200k() -> Option<&'static CoreBPE> {
    O200K
        .get_or_init(|| match o200k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::error!("Failed to load o200k_base tokenizer: {}", e);
                None
            },
        })
        .as_ref()
}

/// Count tokens using the default encoding (cl100k_base)
///
/// This is the most commonly used encoding for GPT-3.5/GPT-4 models.
///
/// # Example
/// ```
/// use relay::tokenizer::count_tokens;
///
/// let tokens = count_tokens("Hello, world!");
/// assert!(tokens > 0);
/// assert!(tokens < 10);
/// ```
pub fn count_tokens(text: &str) -> usize {
    count_tokens_with_encoding(text, Encoding::Cl100kBase)
}

/// Count tokens with a specific encoding
///
/// Falls back to the heuristic when an encoder cannot be loaded.
pub fn count_tokens_with_encoding(text: &str, encoding: Encoding) -> usize {
    let bpe = match encoding {
        Encoding::Cl100kBase => get_cl100k(),
        Encoding::O200kBase => get_o200k(),
        Encoding::Heuristic => None,
    };

    match bpe {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => heuristic_count(text),
    }
}

/// Count tokens for a specific model name
///
/// Infers the encoding from the model name and counts tokens.
///
/// # Example
/// ```
/// use relay::tokenizer::count_tokens_for_model;
///
/// let tokens = count_tokens_for_model("Hello!", "gpt-4o");
/// assert!(tokens > 0);
/// ```
pub fn count_tokens_for_model(text: &str, model: &str) -> usize {
    count_tokens_with_encoding(text, Encoding::infer_from_id(model))
}

/// Heuristic token count (~4 characters per token)
fn heuristic_count(text: &str) -> usize {
    // Round up to avoid underestimating
    text.len().div_ceil(4)
}

/// [`TokenCounter`] backed by tiktoken encodings.
///
/// # Example
/// ```
/// use relay::relay::{CanonicalRequest, RelayMode};
/// use relay::tokenizer::{TiktokenCounter, TokenCounter};
///
/// let counter = TiktokenCounter::new();
/// let request: CanonicalRequest = serde_json::from_str(
///     r#"{"model":"gpt-4","messages":[{"role":"user","content":"Hello"}]}"#,
/// ).unwrap();
///
/// assert!(counter.count_request(&request, RelayMode::ChatCompletions) > 0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenCounter;

impl TiktokenCounter {
    /// Create a new counter.
    pub fn new() -> Self {
        Self
    }

    /// Tokens of a chat conversation, framing overhead included.
    pub fn count_messages(&self, messages: &[Message], model: &str) -> i64 {
        let encoding = Encoding::infer_from_id(model);

        // gpt-3.5-turbo-0301 frames messages differently
        let (tokens_per_message, tokens_per_name) = if model.contains("gpt-3.5-turbo-0301") {
            (4, -1)
        } else {
            (3, 1)
        };

        let mut total = 0i64;
        for message in messages {
            total += tokens_per_message;
            total += count_tokens_with_encoding(&message.role, encoding) as i64;

            match &message.content {
                Some(MessageContent::Text(text)) => {
                    total += count_tokens_with_encoding(text, encoding) as i64;
                },
                Some(MessageContent::Parts(parts)) => {
                    for part in parts {
                        match part.part_type.as_str() {
                            "text" => {
                                let text = part.text.as_deref().unwrap_or_default();
                                total += count_tokens_with_encoding(text, encoding) as i64;
                            },
                            "image_url" => total += IMAGE_PART_TOKENS,
                            _ => {},
                        }
                    }
                },
                None => {},
            }

            if let Some(name) = &message.name {
                total += tokens_per_name;
                total += count_tokens_with_encoding(name, encoding) as i64;
            }
        }

        total + REPLY_PRIMING_TOKENS
    }

    /// Tokens of a prompt/input value (string or array of strings).
    pub fn count_input(&self, input: &serde_json::Value, model: &str) -> i64 {
        let encoding = Encoding::infer_from_id(model);
        text_inputs(input)
            .into_iter()
            .map(|text| count_tokens_with_encoding(text, encoding) as i64)
            .sum()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_request(&self, request: &CanonicalRequest, mode: RelayMode) -> i64 {
        match mode {
            RelayMode::ChatCompletions => request
                .messages
                .as_deref()
                .map(|messages| self.count_messages(messages, &request.model))
                .unwrap_or(0),
            RelayMode::Completions => request
                .prompt
                .as_ref()
                .map(|prompt| self.count_input(prompt, &request.model))
                .unwrap_or(0),
            RelayMode::Moderations => request
                .input
                .as_ref()
                .map(|input| self.count_input(input, &request.model))
                .unwrap_or(0),
            RelayMode::Embeddings | RelayMode::Edits => 0,
        }
    }

    fn count_text(&self, text: &str, model: &str) -> i64 {
        count_tokens_for_model(text, model) as i64
    }
}
