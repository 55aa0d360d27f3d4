//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables
//! - CLI arguments (for the server)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::relay::{ChannelType, RatioTable, RelayMeta, RelayMode};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota reservation and settlement
    #[serde(default)]
    pub billing: BillingConfig,

    /// Price tables
    #[serde(default)]
    pub ratios: RatioConfig,

    /// Backend channels, in selection order
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Accounts and their starting quota
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location (`<config dir>/relay/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("relay").join("config.toml"))
    }

    /// Load from `path`, or the default location when it exists, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };

        let config = file.merge(Self::from_env());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("RELAY_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("RELAY_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(val) = std::env::var("RELAY_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                config.server.timeout_secs = val;
            }
        }
        if let Ok(val) = std::env::var("RELAY_PRE_CONSUMED_QUOTA") {
            if let Ok(val) = val.parse() {
                config.billing.pre_consumed_quota = val;
            }
        }

        config
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let server_default = ServerConfig::default();
        let billing_default = BillingConfig::default();

        Self {
            server: ServerConfig {
                host: if other.server.host != server_default.host {
                    other.server.host
                } else {
                    self.server.host
                },
                port: if other.server.port != server_default.port {
                    other.server.port
                } else {
                    self.server.port
                },
                timeout_secs: if other.server.timeout_secs != server_default.timeout_secs {
                    other.server.timeout_secs
                } else {
                    self.server.timeout_secs
                },
                verbose: self.server.verbose || other.server.verbose,
                ..self.server
            },
            billing: BillingConfig {
                pre_consumed_quota: if other.billing.pre_consumed_quota
                    != billing_default.pre_consumed_quota
                {
                    other.billing.pre_consumed_quota
                } else {
                    self.billing.pre_consumed_quota
                },
                ..self.billing
            },
            ratios: if other.ratios.is_empty() {
                self.ratios
            } else {
                other.ratios
            },
            channels: if other.channels.is_empty() {
                self.channels
            } else {
                other.channels
            },
            accounts: if other.accounts.is_empty() {
                self.accounts
            } else {
                other.accounts
            },
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                return Err(RelayError::Config(format!("duplicate channel id {}", channel.id)));
            }
            if channel.base_url.is_empty() && channel.channel_type.default_base_url().is_empty() {
                return Err(RelayError::Config(format!(
                    "channel {} ({}) needs a base_url",
                    channel.id, channel.name
                )));
            }
        }

        let mut tokens = HashSet::new();
        for account in &self.accounts {
            if account.token.is_empty() {
                return Err(RelayError::Config("account token must not be empty".to_string()));
            }
            if !tokens.insert(account.token.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate account token for {}",
                    account.id()
                )));
            }
        }

        Ok(())
    }

    /// First channel serving `model`
    pub fn channel_for(&self, model: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|channel| channel.serves(model))
    }

    /// Account presenting `token`
    pub fn account_for(&self, token: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|account| account.token == token)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Upstream request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum request body size in bytes
    pub max_body_size: usize,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout_secs: 120,
            verbose: false,
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upstream timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Quota reservation and settlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Token allowance reserved on top of the prompt for the unknown completion
    pub pre_consumed_quota: i64,

    /// Ratio charged for models missing from the ratio table
    pub default_model_ratio: f64,

    /// Settlements running at once
    pub settlement_workers: usize,

    /// Settlements waiting before submissions spill onto their own tasks
    pub settlement_queue: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            pre_consumed_quota: 500,
            default_model_ratio: 30.0,
            settlement_workers: 4,
            settlement_queue: 1024,
        }
    }
}

/// Price tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioConfig {
    /// Model name to price multiplier
    pub model: HashMap<String, f64>,

    /// Model name to completion-token multiplier
    pub completion: HashMap<String, f64>,

    /// Account group to price multiplier
    pub group: HashMap<String, f64>,
}

impl RatioConfig {
    fn is_empty(&self) -> bool {
        self.model.is_empty() && self.completion.is_empty() && self.group.is_empty()
    }

    /// Build the lookup table
    pub fn table(&self, default_model_ratio: f64) -> RatioTable {
        RatioTable::from_tables(
            self.model.clone(),
            self.completion.clone(),
            self.group.clone(),
            default_model_ratio,
        )
    }
}

/// One backend channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel id, used in logs
    pub id: u64,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Backend vendor
    #[serde(rename = "type", default)]
    pub channel_type: ChannelType,

    /// Base URL; empty uses the vendor default
    #[serde(default)]
    pub base_url: String,

    /// Credential sent upstream
    #[serde(default)]
    pub key: String,

    /// Models this channel serves (client-facing names)
    #[serde(default)]
    pub models: Vec<String>,

    /// Client-facing model name to upstream model name
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    /// API version (Azure)
    #[serde(default)]
    pub api_version: Option<String>,
}

impl ChannelConfig {
    /// Whether this channel serves `model`
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Relay context for a call through this channel
    pub fn meta(&self, mode: RelayMode, request_path: &str) -> RelayMeta {
        RelayMeta::new(mode, self.channel_type)
            .with_channel_id(self.id)
            .with_base_url(&self.base_url)
            .with_api_key(&self.key)
            .with_api_version(self.api_version.clone())
            .with_model_mapping(self.model_mapping.clone())
            .with_request_path(request_path)
    }
}

/// One quota account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Bearer token presented by clients
    pub token: String,

    /// Account id in the ledger; defaults to the token
    #[serde(default)]
    pub name: String,

    /// Billing group
    #[serde(default = "default_group")]
    pub group: String,

    /// Starting quota
    #[serde(default)]
    pub quota: i64,
}

impl AccountConfig {
    /// Ledger account id
    pub fn id(&self) -> &str {
        if self.name.is_empty() {
            &self.token
        } else {
            &self.name
        }
    }
}

fn default_group() -> String {
    "default".to_string()
}
