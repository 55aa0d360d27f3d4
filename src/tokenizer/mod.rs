//! Token counting utilities.
//!
//! This module provides accurate token counting using tiktoken encodings
//! for OpenAI-compatible models, with heuristic fallback for others.
//! Prompt-token counts drive quota reservations, so counting must be
//! deterministic for a given request and model.
//!
//! # Supported Encodings
//!
//! - **cl100k_base**: GPT-3.5, GPT-4
//! - **o200k_base**: GPT-4o, o1, o3 models
//! - **heuristic**: ~4 characters per token fallback
//!
//! # Example
//!
//! ```
//! use relay::tokenizer::{count_tokens, count_tokens_with_encoding, Encoding};
//!
//! // Count with default encoding (cl100k)
//! let tokens = count_tokens("Hello, world!");
//! assert!(tokens > 0);
//!
//! // Count with specific encoding
//! let tokens = count_tokens_with_encoding("Hello, world!", Encoding::O200kBase);
//! assert!(tokens > 0);
//! ```

mod counter;
mod encoding;

pub use counter::{
    count_tokens, count_tokens_for_model, count_tokens_with_encoding, TiktokenCounter,
};
pub use encoding::Encoding;

use crate::relay::{CanonicalRequest, RelayMode};

/// Counts prompt and completion tokens for billing.
pub trait TokenCounter: Send + Sync {
    /// Prompt tokens of a canonical request under a relay mode.
    fn count_request(&self, request: &CanonicalRequest, mode: RelayMode) -> i64;

    /// Tokens of free text produced by `model`.
    fn count_text(&self, text: &str, model: &str) -> i64;
}
