//! Server state and account lookup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};

use crate::config::{AccountConfig, ChannelConfig, Config};
use crate::error::{RelayError, Result};
use crate::relay::normalize::DEFAULT_MODERATION_MODEL;
use crate::relay::{AdaptorRegistry, InMemoryLedger, Relay, RelayMode};
use crate::tokenizer::TiktokenCounter;

/// Application state shared across handlers
pub struct AppState {
    /// Loaded configuration
    pub config: Config,
    /// Relay core
    pub relay: Relay,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Wrap an existing relay.
    pub fn new(config: Config, relay: Relay) -> Self {
        Self {
            config,
            relay,
            start_time: Instant::now(),
        }
    }

    /// Build the relay from configuration, seeding an in-memory ledger with
    /// the configured accounts. Must be called inside a tokio runtime.
    pub fn from_config(config: Config) -> Result<Self> {
        let ledger = InMemoryLedger::with_accounts(
            config
                .accounts
                .iter()
                .map(|account| (account.id().to_string(), account.quota)),
        );
        let ratios = config.ratios.table(config.billing.default_model_ratio);
        let adaptors = AdaptorRegistry::with_timeout(config.server.timeout())?;

        let relay = Relay::new(
            Arc::new(ratios),
            Arc::new(ledger),
            Arc::new(TiktokenCounter::new()),
            Arc::new(adaptors),
            &config.billing,
        );

        Ok(Self::new(config, relay))
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Account behind the request's bearer token.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<&AccountConfig> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_start_matches("Bearer ").trim())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RelayError::UnknownAccount("missing bearer token".to_string()))?;

        self.config
            .account_for(token)
            .ok_or_else(|| RelayError::UnknownAccount("invalid token".to_string()))
    }

    /// Channel serving the model named in `body`.
    pub fn select_channel(&self, body: &[u8], mode: RelayMode) -> Result<&ChannelConfig> {
        let model = requested_model(body, mode)?;
        self.config
            .channel_for(&model)
            .ok_or(RelayError::NoChannel(model))
    }
}

/// Model named by a raw request body, without full validation.
fn requested_model(body: &[u8], mode: RelayMode) -> Result<String> {
    let json: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("malformed request body: {e}")))?;

    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default();

    match model {
        "" if mode == RelayMode::Moderations => Ok(DEFAULT_MODERATION_MODEL.to_string()),
        "" => Err(RelayError::InvalidRequest("model is required".to_string())),
        model => Ok(model.to_string()),
    }
}
