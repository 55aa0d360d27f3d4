//! Inbound request normalization.
//!
//! Parses the raw body into a [`CanonicalRequest`], validates it for the relay
//! mode, applies the channel's model mapping and counts prompt tokens. Nothing
//! here touches quota or the network.

use std::collections::HashMap;

use crate::error::{RelayError, Result};
use crate::tokenizer::TokenCounter;

use super::meta::RelayMode;
use super::request::{is_empty_input, CanonicalRequest};

/// Upper bound accepted for `max_tokens`.
const MAX_TOKENS_LIMIT: i64 = (i32::MAX / 2) as i64;

/// Model used for moderation calls that name none.
pub const DEFAULT_MODERATION_MODEL: &str = "text-moderation-latest";

/// Resolves a requested model name to the name sent upstream.
pub trait ModelMapper: Send + Sync {
    /// Returns the effective name and whether it differs from the request.
    fn resolve(&self, requested: &str) -> (String, bool);
}

/// Table-backed [`ModelMapper`]; entries mapping to an empty string are ignored.
#[derive(Debug, Clone, Default)]
pub struct ModelMapping {
    table: HashMap<String, String>,
}

impl ModelMapping {
    /// Wrap a mapping table.
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

impl ModelMapper for ModelMapping {
    fn resolve(&self, requested: &str) -> (String, bool) {
        match self.table.get(requested) {
            Some(mapped) if !mapped.is_empty() => (mapped.clone(), mapped != requested),
            _ => (requested.to_string(), false),
        }
    }
}

/// Output of normalization.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    /// Parsed request, model already mapped.
    pub request: CanonicalRequest,
    /// Model as the client sent it.
    pub origin_model: String,
    /// Whether mapping renamed the model.
    pub is_model_mapped: bool,
    /// Prompt tokens under the mode's counting rule.
    pub prompt_tokens: i64,
}

/// Parses, validates and maps inbound requests.
pub struct RequestNormalizer<'a> {
    mapper: &'a dyn ModelMapper,
    counter: &'a dyn TokenCounter,
}

impl<'a> RequestNormalizer<'a> {
    /// Create a normalizer over a mapper and a token counter.
    pub fn new(mapper: &'a dyn ModelMapper, counter: &'a dyn TokenCounter) -> Self {
        Self { mapper, counter }
    }

    /// Parse and validate `body` for `mode`, then map the model.
    pub fn normalize(&self, body: &[u8], mode: RelayMode) -> Result<NormalizedRequest> {
        let mut request: CanonicalRequest = serde_json::from_slice(body)
            .map_err(|e| RelayError::InvalidRequest(format!("malformed request body: {e}")))?;

        if mode == RelayMode::Moderations && request.model.is_empty() {
            request.model = DEFAULT_MODERATION_MODEL.to_string();
        }

        validate(&request, mode)?;

        let origin_model = request.model.clone();
        let (effective, is_model_mapped) = self.mapper.resolve(&origin_model);
        request.model = effective;

        let prompt_tokens = self.counter.count_request(&request, mode);

        Ok(NormalizedRequest {
            request,
            origin_model,
            is_model_mapped,
            prompt_tokens,
        })
    }
}

/// Mode-specific structural validation.
pub fn validate(request: &CanonicalRequest, mode: RelayMode) -> Result<()> {
    if let Some(max_tokens) = request.max_tokens {
        if !(0..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
            return Err(RelayError::InvalidRequest("max_tokens is invalid".to_string()));
        }
    }

    if request.model.is_empty() {
        return Err(RelayError::InvalidRequest("model is required".to_string()));
    }

    let missing = match mode {
        RelayMode::Completions if is_empty_input(request.prompt.as_ref()) => Some("prompt"),
        RelayMode::ChatCompletions
            if request.messages.as_ref().map_or(true, Vec::is_empty) =>
        {
            Some("messages")
        },
        RelayMode::Embeddings | RelayMode::Moderations
            if is_empty_input(request.input.as_ref()) =>
        {
            Some("input")
        },
        RelayMode::Edits if request.instruction.as_deref().map_or(true, str::is_empty) => {
            Some("instruction")
        },
        _ => None,
    };

    if let Some(field) = missing {
        return Err(RelayError::InvalidRequest(format!("field {field} is required")));
    }

    if mode == RelayMode::Edits && request.stream {
        return Err(RelayError::UnsupportedFeature("streaming edits".to_string()));
    }

    Ok(())
}
