//! Per-call relay context.
//!
//! [`RelayMeta`] is assembled once per inbound call from the selected channel
//! and the authenticated account, completed by normalization, and then only
//! read by the adaptor, the billing path and the logging path.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of operation requested by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// `/v1/chat/completions`
    #[default]
    ChatCompletions,
    /// `/v1/completions`
    Completions,
    /// `/v1/embeddings`
    Embeddings,
    /// `/v1/moderations`
    Moderations,
    /// `/v1/edits`
    Edits,
}

impl RelayMode {
    /// Infer the mode from an inbound request path.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);

        if path.starts_with("/v1/chat/completions") {
            Some(Self::ChatCompletions)
        } else if path.starts_with("/v1/completions") {
            Some(Self::Completions)
        } else if path.starts_with("/v1/embeddings") || path.ends_with("embeddings") {
            Some(Self::Embeddings)
        } else if path.starts_with("/v1/moderations") {
            Some(Self::Moderations)
        } else if path.starts_with("/v1/edits") {
            Some(Self::Edits)
        } else {
            None
        }
    }

    /// Path segment after `/v1/`, used by deployment-style URLs.
    pub fn task(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat/completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::Edits => "edits",
        }
    }
}

/// Wire-protocol family of a backend; selects the adaptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    /// OpenAI-compatible; requests pass through unconverted.
    #[default]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Gemini API.
    Gemini,
}

impl ApiType {
    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Concrete backend vendor of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// api.openai.com
    #[default]
    OpenAi,
    /// Azure OpenAI deployments.
    Azure,
    /// Baichuan; rejects `frequency_penalty: 0`.
    Baichuan,
    /// OpenRouter.
    OpenRouter,
    /// Any other OpenAI-compatible endpoint.
    Custom,
    /// Anthropic.
    Anthropic,
    /// Google Gemini.
    Gemini,
}

impl ChannelType {
    /// Protocol family spoken by this vendor.
    pub fn api_type(&self) -> ApiType {
        match self {
            Self::Anthropic => ApiType::Anthropic,
            Self::Gemini => ApiType::Gemini,
            _ => ApiType::OpenAi,
        }
    }

    /// Default base URL; empty when the vendor has none.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Baichuan => "https://api.baichuan-ai.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Azure | Self::Custom => "",
        }
    }

    /// Whether canonical requests must be re-serialized before forwarding.
    pub fn requires_field_correction(&self) -> bool {
        matches!(self, Self::Baichuan)
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" => Ok(Self::Azure),
            "baichuan" => Ok(Self::Baichuan),
            "openrouter" => Ok(Self::OpenRouter),
            "custom" => Ok(Self::Custom),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            _ => Err(format!("Unknown channel type: {}", s)),
        }
    }
}

/// Request context shared by every stage of one relay call.
#[derive(Debug, Clone, Default)]
pub struct RelayMeta {
    /// Operation requested.
    pub mode: RelayMode,
    /// Protocol family of the selected channel.
    pub api_type: ApiType,
    /// Vendor of the selected channel.
    pub channel_type: ChannelType,
    /// Selected channel id.
    pub channel_id: u64,
    /// Channel base URL.
    pub base_url: String,
    /// Channel credential.
    pub api_key: String,
    /// Azure API version.
    pub api_version: Option<String>,
    /// Channel's model mapping table.
    pub model_mapping: HashMap<String, String>,
    /// Inbound request path, query included.
    pub request_path: String,
    /// Quota account (token) the call is billed to.
    pub account: String,
    /// Billing group of the account.
    pub group: String,
    /// Model as requested by the client.
    pub origin_model: String,
    /// Model after mapping; what the backend sees.
    pub actual_model: String,
    /// Whether the response streams.
    pub is_stream: bool,
    /// Counted prompt tokens.
    pub prompt_tokens: i64,
}

impl RelayMeta {
    /// Create a context for a call against a channel.
    pub fn new(mode: RelayMode, channel_type: ChannelType) -> Self {
        Self {
            mode,
            api_type: channel_type.api_type(),
            channel_type,
            base_url: channel_type.default_base_url().to_string(),
            request_path: format!("/v1/{}", mode.task()),
            group: "default".to_string(),
            ..Default::default()
        }
    }

    /// Set the channel id.
    pub fn with_channel_id(mut self, id: u64) -> Self {
        self.channel_id = id;
        self
    }

    /// Override the base URL; empty keeps the vendor default.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        if !base_url.is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    /// Set the channel credential.
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = key.to_string();
        self
    }

    /// Set the Azure API version.
    pub fn with_api_version(mut self, version: Option<String>) -> Self {
        self.api_version = version;
        self
    }

    /// Set the model mapping table.
    pub fn with_model_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.model_mapping = mapping;
        self
    }

    /// Set the inbound path.
    pub fn with_request_path(mut self, path: &str) -> Self {
        self.request_path = path.to_string();
        self
    }

    /// Set the billed account and its group.
    pub fn with_account(mut self, account: &str, group: &str) -> Self {
        self.account = account.to_string();
        self.group = group.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_path() {
        assert_eq!(
            RelayMode::from_path("/v1/chat/completions"),
            Some(RelayMode::ChatCompletions)
        );
        assert_eq!(RelayMode::from_path("/v1/completions"), Some(RelayMode::Completions));
        assert_eq!(
            RelayMode::from_path("/v1/engines/text-embedding-ada-002/embeddings"),
            Some(RelayMode::Embeddings)
        );
        assert_eq!(RelayMode::from_path("/v1/moderations"), Some(RelayMode::Moderations));
        assert_eq!(RelayMode::from_path("/v1/edits?x=1"), Some(RelayMode::Edits));
        assert_eq!(RelayMode::from_path("/v1/images/generations"), None);
    }

    #[test]
    fn test_channel_type_families() {
        assert_eq!(ChannelType::Azure.api_type(), ApiType::OpenAi);
        assert_eq!(ChannelType::Baichuan.api_type(), ApiType::OpenAi);
        assert_eq!(ChannelType::Anthropic.api_type(), ApiType::Anthropic);
        assert!(ChannelType::Baichuan.requires_field_correction());
        assert!(!ChannelType::OpenAi.requires_field_correction());
    }

    #[test]
    fn test_channel_type_from_str() {
        assert_eq!("OpenRouter".parse::<ChannelType>().unwrap(), ChannelType::OpenRouter);
        assert_eq!("claude".parse::<ChannelType>().unwrap(), ChannelType::Anthropic);
        assert!("bogus".parse::<ChannelType>().is_err());
    }

    #[test]
    fn test_meta_builder() {
        let meta = RelayMeta::new(RelayMode::ChatCompletions, ChannelType::OpenAi)
            .with_base_url("http://localhost:9000/")
            .with_account("sk-test", "vip");

        assert_eq!(meta.base_url, "http://localhost:9000");
        assert_eq!(meta.request_path, "/v1/chat/completions");
        assert_eq!(meta.group, "vip");
        assert_eq!(meta.api_type, ApiType::OpenAi);

        let defaulted = RelayMeta::new(RelayMode::Embeddings, ChannelType::OpenRouter).with_base_url("");
        assert_eq!(defaulted.base_url, "https://openrouter.ai/api");
    }
}
