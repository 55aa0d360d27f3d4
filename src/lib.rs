//! # Relay - metered LLM request relay
//!
//! Forwards one OpenAI-style call to an interchangeable backend while keeping
//! a quota ledger consistent with what actually happened.
//!
//! ## Features
//!
//! - **Request normalization**: validation, model mapping, prompt token counting
//! - **Quota reservation**: reserve before the call, release on failure,
//!   settle on success, each exactly once
//! - **Polymorphic adaptors**: one backend family per [`relay::Adaptor`]
//! - **Response tapping**: the client sees every byte while a copy is kept
//!   for content extraction and billing
//! - **Background settlement**: bounded worker pool that never blocks the
//!   request path
//!
//! ## Request Lifecycle
//!
//! ```text
//!  Client              Relay                    Ledger          Backend
//!    |---- request ---->|                          |                |
//!    |                  |-- normalize              |                |
//!    |                  |-- reserve(pre) --------->|                |
//!    |                  |------------------ request --------------->|
//!    |<==== bytes ======|<================= response ===============|
//!    |                  |-- extract content (audit log)             |
//!    |                  |-- settle(actual) ------->|  (background)  |
//! ```
//!
//! Any failure between reservation and a successful response releases the
//! reservation instead of settling it.
//!
//! ## Quick Start
//!
//! ### Serving
//!
//! ```rust,ignore
//! use relay::{server::RelayServer, Config};
//!
//! let config = Config::load(None)?;
//! RelayServer::new(config)?.run().await?;
//! ```
//!
//! ### Embedding the core
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relay::relay::{AdaptorRegistry, InMemoryLedger, MemoryWriter, RatioTable, Relay};
//! use relay::tokenizer::TiktokenCounter;
//!
//! let relay = Relay::new(
//!     Arc::new(RatioTable::new()),
//!     Arc::new(InMemoryLedger::with_accounts([("alice".to_string(), 100_000)])),
//!     Arc::new(TiktokenCounter::new()),
//!     Arc::new(AdaptorRegistry::default()),
//!     &Default::default(),
//! );
//! let summary = relay.relay(meta, body, MemoryWriter::new()).await?;
//! ```
//!
//! ### Extracting content
//!
//! ```rust
//! use relay::relay::{extract, CapturedResponse};
//!
//! let captured = CapturedResponse {
//!     body: r#"{"choices":[{"message":{"content":"hi"}}]}"#.into(),
//!     is_stream: false,
//! };
//! assert_eq!(extract(&captured), "hi");
//! ```

pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod tokenizer;

// Re-exports for convenience
pub use config::Config;
pub use error::{ErrorKind, RelayError, Result};
pub use relay::{
    Adaptor, AdaptorRegistry, CanonicalRequest, InMemoryLedger, QuotaLedger, Relay, RelayMeta,
    RelayMode, ResponseTap, ResponseWriter, Usage,
};
pub use server::RelayServer;
pub use tokenizer::{
    count_tokens, count_tokens_for_model, count_tokens_with_encoding, TokenCounter,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
