//! HTTP surface for the relay.
//!
//! Exposes OpenAI-compatible endpoints that authenticate the caller by bearer
//! token, pick the first channel serving the requested model and hand the
//! call to [`Relay`](crate::relay::Relay):
//!
//! - `POST /v1/chat/completions`, `/v1/completions`, `/v1/embeddings`,
//!   `/v1/engines/{model}/embeddings`, `/v1/moderations`, `/v1/edits`
//! - `GET /health`, `GET /stats`, `POST /stats/reset`
//!
//! # Example
//!
//! ```rust,ignore
//! use relay::{Config, server::RelayServer};
//!
//! let config = Config::load(None)?;
//! let server = RelayServer::new(config)?;
//! server.run().await?;
//! ```

mod handlers;
mod state;

pub use handlers::create_router;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::{RelayError, Result};

/// Relay HTTP server.
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    /// Build the server and its relay from configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_state(AppState::from_config(config)?))
    }

    /// Serve an existing state.
    pub fn with_state(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Shared state.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Get the router for the server
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let addr = self.state.config.server.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::Config(format!("Failed to bind TCP to {addr}: {e}")))?;

        tracing::info!("Relay listening on http://{}", addr);
        tracing::info!("Channels: {}", self.state.config.channels.len());
        tracing::info!("Accounts: {}", self.state.config.accounts.len());

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then
    /// drain pending settlements.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Draining settlements");
        self.state.relay.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
