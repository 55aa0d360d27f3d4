//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::state::AppState;
use crate::error::RelayError;
use crate::relay::{response_channel, ChannelReceiver, RelayMode};

/// Body chunks buffered between the relay task and the client connection.
const RESPONSE_BUFFER: usize = 64;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let max_body_size = state.config.server.max_body_size;

    Router::new()
        // Health and status
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/stats/reset", post(reset_stats))
        // Relay endpoints
        .route("/v1/chat/completions", post(relay))
        .route("/v1/completions", post(relay))
        .route("/v1/embeddings", post(relay))
        .route("/v1/engines/:model/embeddings", post(engine_embeddings))
        .route("/v1/moderations", post(relay))
        .route("/v1/edits", post(relay))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Seconds since start
    pub uptime_secs: u64,
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime().as_secs(),
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.stats().summary())
}

async fn reset_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.relay.stats().reset();
    Json(json!({"status": "reset"}))
}

/// `/v1/engines/{model}/embeddings`: the path names the model when the body does not.
async fn engine_embeddings(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = with_path_model(body, &model);
    relay(State(state), uri, headers, body).await
}

fn with_path_model(body: Bytes, model: &str) -> Bytes {
    let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };

    let has_model = object
        .get("model")
        .and_then(Value::as_str)
        .is_some_and(|m| !m.is_empty());
    if has_model {
        return body;
    }

    object.insert("model".to_string(), Value::String(model.to_string()));
    match serde_json::to_vec(&Value::Object(object)) {
        Ok(rewritten) => Bytes::from(rewritten),
        Err(_) => body,
    }
}

/// Relay one call.
///
/// The relay runs on its own task and writes through a channel. Once it
/// writes a head the response streams from the channel; if it finishes
/// without writing one, its error becomes the response.
async fn relay(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let Some(mode) = RelayMode::from_path(path) else {
        return RelayError::InvalidRequest(format!("unsupported path {path}")).into_response();
    };

    let account = match state.authenticate(&headers) {
        Ok(account) => account,
        Err(e) => return e.into_response(),
    };
    let channel = match state.select_channel(&body, mode) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(account = account.id(), "{}", e);
            return e.into_response();
        },
    };

    let meta = channel
        .meta(mode, path)
        .with_account(account.id(), &account.group);

    let (writer, receiver) = response_channel(RESPONSE_BUFFER);
    let task_state = state.clone();
    let task = tokio::spawn(async move { task_state.relay.relay(meta, body, writer).await });

    let ChannelReceiver { head, body } = receiver;
    match head.await {
        Ok(head) => {
            let mut response = Response::new(Body::from_stream(ChannelReceiver::into_body_stream(body)));
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            response
        },
        // Writer dropped without a head: the relay is done or failed early
        Err(_) => match task.await {
            Ok(Ok(_)) => Response::default(),
            Ok(Err(e)) => e.into_response(),
            Err(e) => {
                tracing::error!("Relay task failed: {}", e);
                RelayError::Io(std::io::Error::other(e.to_string())).into_response()
            },
        },
    }
}
