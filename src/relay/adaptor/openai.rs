//! OpenAI-compatible passthrough adaptor.
//!
//! Serves OpenAI, Azure OpenAI, OpenRouter, Baichuan and any custom endpoint
//! speaking the same protocol. Requests are forwarded as built by
//! [`build_request_body`](super::build_request_body); responses are written to
//! the client byte for byte.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use reqwest::Client;
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::relay::meta::{ChannelType, RelayMeta, RelayMode};
use crate::relay::request::{CanonicalRequest, Usage};
use crate::relay::tap::ResponseWriter;

use super::{error_from_body, Adaptor, ResponseOutcome, SseScanner, UpstreamResponse};

const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

/// Headers never copied from the backend response.
const HOP_BY_HOP: [&str; 4] = [
    "connection",
    "content-length",
    "transfer-encoding",
    "content-encoding",
];

#[derive(Debug, Clone)]
struct Prepared {
    url: String,
    headers: HeaderMap,
}

/// Adaptor for OpenAI-compatible backends.
pub struct OpenAiAdaptor {
    client: Client,
    prepared: Option<Prepared>,
}

impl OpenAiAdaptor {
    /// Create an adaptor sending through `client`.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            prepared: None,
        }
    }

    /// Full upstream URL for a call.
    pub fn request_url(meta: &RelayMeta) -> String {
        match meta.channel_type {
            ChannelType::Azure => {
                // Azure deployment names cannot contain dots
                let deployment = meta.actual_model.replace('.', "");
                let version = meta
                    .api_version
                    .as_deref()
                    .unwrap_or(DEFAULT_AZURE_API_VERSION);
                format!(
                    "{}/openai/deployments/{}/{}?api-version={}",
                    meta.base_url,
                    deployment,
                    meta.mode.task(),
                    version
                )
            },
            _ => format!("{}{}", meta.base_url, meta.request_path),
        }
    }

    /// Authentication and content headers for a call.
    pub fn request_headers(meta: &RelayMeta) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if meta.is_stream {
            headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        if meta.api_key.is_empty() {
            return Ok(headers);
        }

        let invalid = |_| RelayError::Config("channel key is not a valid header value".to_string());
        match meta.channel_type {
            ChannelType::Azure => {
                headers.insert("api-key", HeaderValue::from_str(&meta.api_key).map_err(invalid)?);
            },
            _ => {
                let bearer = format!("Bearer {}", meta.api_key);
                headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&bearer).map_err(invalid)?);
            },
        }
        Ok(headers)
    }

    fn event_stream_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        headers
    }

    async fn stream_response(
        &self,
        response: UpstreamResponse,
        writer: &dyn ResponseWriter,
    ) -> Result<ResponseOutcome> {
        writer.write_head(StatusCode::OK, Self::event_stream_headers())?;

        let mut scanner = SseScanner::new();
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            scanner.feed(&chunk);
            writer.write(chunk).await?;
        }
        scanner.finish();

        // Forwarded bytes stay on the wire; the call itself still failed
        if let Some(error) = scanner.error() {
            tracing::warn!(events = scanner.events(), "Backend reported an error inside the stream: {}", error);
            return Err(RelayError::UpstreamApplication {
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                message: error.to_string(),
                code: None,
            });
        }
        if !scanner.is_done() {
            tracing::debug!(events = scanner.events(), "Stream ended without [DONE]");
        }

        Ok(ResponseOutcome {
            reported: scanner.usage(),
            completion_text: scanner.content().to_string(),
        })
    }

    async fn buffered_response(
        &self,
        response: UpstreamResponse,
        writer: &dyn ResponseWriter,
    ) -> Result<ResponseOutcome> {
        let status = response.status;
        let mut headers = response.headers.clone();
        for name in HOP_BY_HOP {
            headers.remove(name);
        }

        let body = response.collect().await?;

        // Inspect before writing so an embedded error leaves the client untouched
        let parsed = serde_json::from_slice::<Value>(&body).ok();
        if let Some(json) = &parsed {
            let error_type = json
                .get("error")
                .and_then(|error| error.get("type"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !error_type.is_empty() {
                return Err(error_from_body(status, &body));
            }
        }

        writer.write_head(status, headers)?;
        writer.write(body).await?;

        let reported = parsed
            .as_ref()
            .and_then(|json| json.get("usage"))
            .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok());

        Ok(ResponseOutcome {
            reported,
            completion_text: parsed.as_ref().map(choice_text).unwrap_or_default(),
        })
    }
}

/// Text of every choice: chat `message.content` or completion `text`.
fn choice_text(json: &Value) -> String {
    let Some(choices) = json.get("choices").and_then(Value::as_array) else {
        return String::new();
    };

    choices
        .iter()
        .filter_map(|choice| {
            choice
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
                .or_else(|| choice.get("text").and_then(Value::as_str))
        })
        .collect()
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn init(&mut self, meta: &RelayMeta) -> Result<()> {
        if meta.base_url.is_empty() {
            return Err(RelayError::Config(format!(
                "channel {} has no base URL",
                meta.channel_id
            )));
        }

        self.prepared = Some(Prepared {
            url: Self::request_url(meta),
            headers: Self::request_headers(meta)?,
        });
        Ok(())
    }

    fn convert_request(&self, _mode: RelayMode, request: &CanonicalRequest) -> Result<Value> {
        Ok(serde_json::to_value(request)?)
    }

    async fn do_request(&self, meta: &RelayMeta, body: Bytes) -> Result<UpstreamResponse> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| RelayError::Config("adaptor used before init".to_string()))?;

        tracing::debug!(url = %prepared.url, channel = meta.channel_id, "Sending upstream request");

        let response = self
            .client
            .post(&prepared.url)
            .headers(prepared.headers.clone())
            .body(body)
            .send()
            .await?;

        Ok(UpstreamResponse::from_reqwest(response))
    }

    async fn do_response(
        &self,
        meta: &RelayMeta,
        response: UpstreamResponse,
        writer: &dyn ResponseWriter,
    ) -> Result<ResponseOutcome> {
        if meta.is_stream {
            self.stream_response(response, writer).await
        } else {
            self.buffered_response(response, writer).await
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::relay::tap::MemoryWriter;

    fn meta(channel_type: ChannelType) -> RelayMeta {
        let mut meta = RelayMeta::new(RelayMode::ChatCompletions, channel_type)
            .with_base_url("https://backend.test")
            .with_api_key("sk-test");
        meta.actual_model = "gpt-3.5-turbo".to_string();
        meta
    }

    #[test]
    fn test_openai_url_and_bearer() {
        let meta = meta(ChannelType::OpenAi);
        assert_eq!(
            OpenAiAdaptor::request_url(&meta),
            "https://backend.test/v1/chat/completions"
        );

        let headers = OpenAiAdaptor::request_headers(&meta).unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer sk-test");
        assert!(headers.get(header::ACCEPT).is_none());
    }

    #[test]
    fn test_azure_deployment_url_and_key() {
        let meta = meta(ChannelType::Azure).with_api_version(Some("2023-05-15".to_string()));
        assert_eq!(
            OpenAiAdaptor::request_url(&meta),
            "https://backend.test/openai/deployments/gpt-35-turbo/chat/completions?api-version=2023-05-15"
        );

        let headers = OpenAiAdaptor::request_headers(&meta).unwrap();
        assert_eq!(headers["api-key"], "sk-test");
        assert!(headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_init_requires_base_url() {
        let mut adaptor = OpenAiAdaptor::new(Client::new());
        let meta = RelayMeta::new(RelayMode::ChatCompletions, ChannelType::Custom);
        assert_eq!(adaptor.init(&meta).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn test_buffered_response_written_verbatim() {
        let adaptor = OpenAiAdaptor::new(Client::new());
        let meta = meta(ChannelType::OpenAi);
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        let response = UpstreamResponse::from_bytes(StatusCode::OK, headers, body);

        let writer = MemoryWriter::new();
        let outcome = adaptor.do_response(&meta, response, &writer).await.unwrap();

        assert_eq!(writer.body(), Bytes::from(body));
        assert_eq!(writer.status(), Some(StatusCode::OK));
        assert!(writer.headers().unwrap().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(outcome.reported, Some(Usage::new(5, 1)));
        assert_eq!(outcome.completion_text, "hi");
    }

    #[tokio::test]
    async fn test_embedded_error_writes_nothing() {
        let adaptor = OpenAiAdaptor::new(Client::new());
        let meta = meta(ChannelType::OpenAi);
        let body = r#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        let response = UpstreamResponse::from_bytes(StatusCode::OK, HeaderMap::new(), body);

        let writer = MemoryWriter::new();
        let err = adaptor.do_response(&meta, response, &writer).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert!(!writer.head_written());
        assert!(writer.body().is_empty());
    }

    #[tokio::test]
    async fn test_stream_forwarded_unmodified() {
        let adaptor = OpenAiAdaptor::new(Client::new());
        let mut meta = meta(ChannelType::OpenAi);
        meta.is_stream = true;

        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let expected: Vec<u8> = chunks
            .iter()
            .flat_map(|chunk: &Result<Bytes>| chunk.as_ref().unwrap().to_vec())
            .collect();
        let response = UpstreamResponse::from_chunks(StatusCode::OK, HeaderMap::new(), chunks);

        let writer = MemoryWriter::new();
        let outcome = adaptor.do_response(&meta, response, &writer).await.unwrap();

        assert_eq!(writer.body().to_vec(), expected);
        assert_eq!(writer.chunks().len(), 3);
        assert_eq!(writer.headers().unwrap()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(outcome.completion_text, "Hello");
        assert_eq!(outcome.reported, None);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_terminal() {
        let adaptor = OpenAiAdaptor::new(Client::new());
        let mut meta = meta(ChannelType::OpenAi);
        meta.is_stream = true;

        let chunks = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n")),
            Err(RelayError::UpstreamUnreachable("connection reset".to_string())),
        ];
        let response = UpstreamResponse::from_chunks(StatusCode::OK, HeaderMap::new(), chunks);

        let writer = MemoryWriter::new();
        let err = adaptor.do_response(&meta, response, &writer).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamUnreachable);
        assert_eq!(writer.chunks().len(), 1);
    }

    #[tokio::test]
    async fn test_error_inside_stream_fails_the_call() {
        let adaptor = OpenAiAdaptor::new(Client::new());
        let mut meta = meta(ChannelType::OpenAi);
        meta.is_stream = true;

        let chunks = vec![
            Ok(Bytes::from_static(
                b"data: {\"error\":{\"message\":\"model overloaded\",\"type\":\"server_error\"}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let response = UpstreamResponse::from_chunks(StatusCode::OK, HeaderMap::new(), chunks);

        let writer = MemoryWriter::new();
        let err = adaptor.do_response(&meta, response, &writer).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_structured().message, "model overloaded");
        // Already forwarded before the error was seen
        assert_eq!(writer.chunks().len(), 2);
    }

    #[test]
    fn test_convert_request_passes_body_through() {
        let adaptor = OpenAiAdaptor::new(Client::new());
        let request: CanonicalRequest =
            serde_json::from_str(r#"{"model":"m","instruction":"fix"}"#).unwrap();

        let value = adaptor.convert_request(RelayMode::Edits, &request).unwrap();
        assert_eq!(value["model"], "m");
        assert_eq!(value["instruction"], "fix");
    }
}
