//! End-to-end relay tests.
//!
//! A fake OpenAI-compatible backend and the relay server both run on
//! ephemeral ports; a reqwest client plays the caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use relay::config::Config;
use relay::relay::{AdaptorRegistry, InMemoryLedger, RatioTable, Relay, RelayStats};
use relay::server::{AppState, RelayServer};
use relay::tokenizer::TiktokenCounter;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const BALANCE: i64 = 1_000_000;
const UPSTREAM_KEY: &str = "sk-upstream";

const STREAM_FRAMES: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2,\"total_tokens\":11}}\n\n",
    "data: [DONE]\n\n",
);

async fn fake_completions(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {UPSTREAM_KEY}"));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "bad key", "type": "auth"}})),
        )
            .into_response();
    }

    if body["model"] == "broken" {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"message": "overloaded", "type": "server_error", "code": "overloaded"}})),
        )
            .into_response();
    }

    if body["stream"] == true {
        return ([(header::CONTENT_TYPE, "text/event-stream")], STREAM_FRAMES).into_response();
    }

    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": body["model"],
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello there"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
    }))
    .into_response()
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new().route("/v1/chat/completions", post(fake_completions));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Harness {
    base: String,
    ledger: Arc<InMemoryLedger>,
    stats: Arc<RelayStats>,
    stop: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let upstream = spawn_upstream().await;
        let config: Config = toml::from_str(&format!(
            r#"
            [[channels]]
            id = 1
            type = "custom"
            base_url = "http://{upstream}"
            key = "{UPSTREAM_KEY}"
            models = ["gpt-4o", "broken"]

            [[accounts]]
            token = "sk-client"
            name = "alice"
            quota = {BALANCE}
            "#
        ))
        .unwrap();

        let ledger = Arc::new(InMemoryLedger::with_accounts([("alice", BALANCE)]));
        let relay = Relay::new(
            Arc::new(RatioTable::new().with_model("gpt-4o", 2.5)),
            ledger.clone(),
            Arc::new(TiktokenCounter::new()),
            Arc::new(AdaptorRegistry::default()),
            &config.billing,
        );
        let stats = relay.stats().clone();
        let server = RelayServer::with_state(AppState::new(config, relay));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            base,
            ledger,
            stats,
            stop,
            server,
        }
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{}{path}", self.base))
            .bearer_auth("sk-client")
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    /// Stop serving and wait for pending settlements.
    async fn finish(self) -> (Arc<InMemoryLedger>, Arc<RelayStats>) {
        let _ = self.stop.send(());
        self.server.await.unwrap();

        // A relay task may still be between writing its last byte and
        // submitting settlement when the server stops
        for _ in 0..200 {
            if self.ledger.outstanding() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (self.ledger, self.stats)
    }
}

#[tokio::test]
async fn test_non_stream_round_trip_settles() {
    let harness = Harness::start().await;

    let response = harness
        .post(
            "/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello there");

    let (ledger, stats) = harness.finish().await;
    assert_eq!(ledger.outstanding(), 0);
    assert!(stats.quota_billed() > 0);
    assert_eq!(ledger.balance("alice"), Some(BALANCE - stats.quota_billed()));
}

#[tokio::test]
async fn test_stream_round_trip_forwards_frames() {
    let harness = Harness::start().await;

    let response = harness
        .post(
            "/v1/chat/completions",
            json!({"model": "gpt-4o", "stream": true, "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(response.text().await.unwrap(), STREAM_FRAMES);

    let (ledger, stats) = harness.finish().await;
    assert_eq!(stats.streaming_requests(), 1);
    assert_eq!(ledger.outstanding(), 0);
    assert_eq!(ledger.balance("alice"), Some(BALANCE - stats.quota_billed()));
}

#[tokio::test]
async fn test_upstream_error_rolls_back() {
    let harness = Harness::start().await;

    let response = harness
        .post(
            "/v1/chat/completions",
            json!({"model": "broken", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "overloaded");
    assert_eq!(body["error"]["code"], "overloaded");

    let (ledger, stats) = harness.finish().await;
    assert_eq!(stats.total_rollbacks(), 1);
    assert_eq!(ledger.outstanding(), 0);
    assert_eq!(ledger.balance("alice"), Some(BALANCE));
}

#[tokio::test]
async fn test_unknown_token_and_model() {
    let harness = Harness::start().await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.base))
        .bearer_auth("sk-nobody")
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness
        .post(
            "/v1/chat/completions",
            json!({"model": "llama-3", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let (ledger, _) = harness.finish().await;
    assert!(ledger.history().is_empty());
}
