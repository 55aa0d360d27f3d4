//! Backend adaptors.
//!
//! An [`Adaptor`] knows how to talk to one wire-protocol family: where to send
//! a call, how to authenticate, how to turn a [`CanonicalRequest`] into the
//! backend's payload and how to turn the backend's answer into the
//! OpenAI-shaped response the client expects. The relay picks one per call
//! through the [`AdaptorRegistry`].
//!
//! # Lifecycle
//!
//! ```text
//! init(meta) -> [convert_request] -> do_request(body) -> do_response(writer)
//! ```
//!
//! `do_request` only fails on transport errors. Status interpretation happens
//! between the two calls ([`is_error_happened`], [`upstream_error`]) and inside
//! `do_response` for errors embedded in a successful status.

mod openai;
mod sse;

pub use openai::OpenAiAdaptor;
pub use sse::{parse_sse_line, SseEvent, SseScanner};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use http::{header, HeaderMap, StatusCode};
use serde_json::Value;

use crate::error::{ErrorEnvelope, RelayError, Result};

use super::meta::{ApiType, RelayMeta, RelayMode};
use super::normalize::NormalizedRequest;
use super::request::{CanonicalRequest, Usage};
use super::tap::ResponseWriter;

/// Raw backend response, body not yet consumed.
pub struct UpstreamResponse {
    /// Backend status.
    pub status: StatusCode,
    /// Backend headers.
    pub headers: HeaderMap,
    /// Body chunks as they arrive.
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl UpstreamResponse {
    /// Wrap a reqwest response; transport errors in the body map to relay errors.
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RelayError::from))
            .boxed();

        Self {
            status,
            headers,
            body,
        }
    }

    /// Response with a body delivered in one piece.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self::from_chunks(status, headers, vec![Ok(body.into())])
    }

    /// Response whose body yields `chunks` in order.
    pub fn from_chunks(status: StatusCode, headers: HeaderMap, chunks: Vec<Result<Bytes>>) -> Self {
        Self {
            status,
            headers,
            body: stream::iter(chunks).boxed(),
        }
    }

    /// `Content-Type` header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Read the whole body.
    pub async fn collect(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// What `do_response` learned about the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// Usage as reported by the backend, if it reported any.
    pub reported: Option<Usage>,
    /// Assistant text, for counting when no usage was reported.
    pub completion_text: String,
}

/// One backend wire-protocol family.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Prepare endpoint and credentials for a call. No network I/O.
    fn init(&mut self, meta: &RelayMeta) -> Result<()>;

    /// Backend payload for a canonical request.
    ///
    /// Fails with `UnsupportedFeature` when the backend cannot express it.
    fn convert_request(&self, mode: RelayMode, request: &CanonicalRequest) -> Result<Value>;

    /// Send the call. Fails only on transport errors.
    async fn do_request(&self, meta: &RelayMeta, body: Bytes) -> Result<UpstreamResponse>;

    /// Interpret a successful-status response and write the client response.
    async fn do_response(
        &self,
        meta: &RelayMeta,
        response: UpstreamResponse,
        writer: &dyn ResponseWriter,
    ) -> Result<ResponseOutcome>;

    /// Adaptor name for logs.
    fn name(&self) -> &'static str;
}

/// Builds an adaptor around the shared HTTP client.
pub type AdaptorFactory = Arc<dyn Fn(reqwest::Client) -> Box<dyn Adaptor> + Send + Sync>;

/// Adaptor lookup by [`ApiType`].
#[derive(Clone)]
pub struct AdaptorRegistry {
    client: reqwest::Client,
    factories: HashMap<ApiType, AdaptorFactory>,
}

impl AdaptorRegistry {
    /// Registry with the built-in OpenAI-compatible adaptor.
    pub fn new(client: reqwest::Client) -> Self {
        let mut registry = Self::empty(client);
        registry.register(ApiType::OpenAi, |client| Box::new(OpenAiAdaptor::new(client)));
        registry
    }

    /// Registry with built-ins and a client using `timeout` per call.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::new(client))
    }

    /// Registry with nothing registered.
    pub fn empty(client: reqwest::Client) -> Self {
        Self {
            client,
            factories: HashMap::new(),
        }
    }

    /// Add or replace the adaptor for an API family.
    pub fn register<F>(&mut self, api_type: ApiType, factory: F)
    where
        F: Fn(reqwest::Client) -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        self.factories.insert(api_type, Arc::new(factory));
    }

    /// Whether an adaptor is registered for `api_type`.
    pub fn supports(&self, api_type: ApiType) -> bool {
        self.factories.contains_key(&api_type)
    }

    /// Fresh adaptor for `api_type`.
    pub fn adaptor_for(&self, api_type: ApiType) -> Result<Box<dyn Adaptor>> {
        self.factories
            .get(&api_type)
            .map(|factory| factory(self.client.clone()))
            .ok_or_else(|| RelayError::InvalidApiType(api_type.to_string()))
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

/// Whether a response must be treated as an error before `do_response`.
///
/// Any non-2xx status is an error, and so is a JSON body where a stream was
/// requested: backends report stream setup failures that way.
pub fn is_error_happened(meta: &RelayMeta, response: &UpstreamResponse) -> bool {
    if !response.status.is_success() {
        return true;
    }
    meta.is_stream
        && response
            .content_type()
            .is_some_and(|content_type| content_type.starts_with("application/json"))
}

/// Turn an error response into an `UpstreamApplication` error.
///
/// Uses the backend's OpenAI-style envelope when present, else the raw body.
pub async fn upstream_error(response: UpstreamResponse) -> RelayError {
    let status = response.status;
    let body = match response.collect().await {
        Ok(body) => body,
        Err(e) => return e,
    };
    error_from_body(status, &body)
}

/// Build an `UpstreamApplication` error from a complete error body.
pub fn error_from_body(status: StatusCode, body: &[u8]) -> RelayError {
    // A 2xx that is still an error keeps no meaningful status.
    let status = if status.is_success() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        status
    };

    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() || !envelope.error.error_type.is_empty() => {
            let code = match envelope.error.code {
                Some(Value::String(code)) if !code.is_empty() => Some(code),
                Some(Value::Number(code)) => Some(code.to_string()),
                _ if !envelope.error.error_type.is_empty() => Some(envelope.error.error_type.clone()),
                _ => None,
            };
            let message = if envelope.error.message.is_empty() {
                envelope.error.error_type
            } else {
                envelope.error.message
            };

            RelayError::UpstreamApplication {
                status: status.as_u16(),
                message,
                code,
            }
        },
        _ => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            let message = if text.is_empty() {
                format!("bad response status code {}", status.as_u16())
            } else {
                text
            };

            RelayError::UpstreamApplication {
                status: status.as_u16(),
                message,
                code: None,
            }
        },
    }
}

/// Body sent upstream.
///
/// OpenAI-compatible channels get the client's bytes untouched unless the
/// model was renamed or the channel needs a field correction; other families
/// always go through [`Adaptor::convert_request`].
pub fn build_request_body(
    adaptor: &dyn Adaptor,
    meta: &RelayMeta,
    normalized: &NormalizedRequest,
    raw: &Bytes,
) -> Result<Bytes> {
    if meta.api_type != ApiType::OpenAi {
        let payload = adaptor.convert_request(meta.mode, &normalized.request)?;
        return Ok(Bytes::from(serde_json::to_vec(&payload)?));
    }

    let correct_fields = meta.channel_type.requires_field_correction();
    if !normalized.is_model_mapped && !correct_fields {
        return Ok(raw.clone());
    }

    let mut request = normalized.request.clone();
    if correct_fields && request.frequency_penalty == Some(0.0) {
        request.frequency_penalty = None;
    }
    Ok(Bytes::from(serde_json::to_vec(&request)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::relay::meta::ChannelType;
    use http::HeaderValue;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    fn normalized(body: &str, mapped: bool) -> NormalizedRequest {
        let request: CanonicalRequest = serde_json::from_str(body).unwrap();
        NormalizedRequest {
            origin_model: request.model.clone(),
            request,
            is_model_mapped: mapped,
            prompt_tokens: 0,
        }
    }

    #[test]
    fn test_error_detection() {
        let mut meta = RelayMeta::new(RelayMode::ChatCompletions, ChannelType::OpenAi);

        let ok = UpstreamResponse::from_bytes(StatusCode::OK, json_headers(), "{}");
        assert!(!is_error_happened(&meta, &ok));

        let failed = UpstreamResponse::from_bytes(StatusCode::TOO_MANY_REQUESTS, HeaderMap::new(), "");
        assert!(is_error_happened(&meta, &failed));

        meta.is_stream = true;
        assert!(is_error_happened(&meta, &ok));

        let mut sse = HeaderMap::new();
        sse.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        let stream = UpstreamResponse::from_bytes(StatusCode::OK, sse, "data: {}\n\n");
        assert!(!is_error_happened(&meta, &stream));
    }

    #[tokio::test]
    async fn test_upstream_error_uses_envelope() {
        let body = r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#;
        let response = UpstreamResponse::from_bytes(StatusCode::TOO_MANY_REQUESTS, json_headers(), body);

        let err = upstream_error(response).await;
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let structured = err.to_structured();
        assert_eq!(structured.message, "Rate limit reached");
        assert_eq!(structured.code, "rate_limit_exceeded");
    }

    #[tokio::test]
    async fn test_upstream_error_without_envelope() {
        let response =
            UpstreamResponse::from_bytes(StatusCode::BAD_GATEWAY, HeaderMap::new(), "upstream exploded");
        let err = upstream_error(response).await;
        assert_eq!(err.to_structured().message, "upstream exploded");

        let empty = error_from_body(StatusCode::SERVICE_UNAVAILABLE, b"");
        assert!(empty.to_string().contains("503"));
    }

    #[test]
    fn test_error_in_success_status_is_500() {
        let err = error_from_body(StatusCode::OK, br#"{"error":{"message":"bad","type":"x"}}"#);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_passthrough_keeps_raw_bytes() {
        let registry = AdaptorRegistry::default();
        let adaptor = registry.adaptor_for(ApiType::OpenAi).unwrap();
        let meta = RelayMeta::new(RelayMode::ChatCompletions, ChannelType::OpenAi);

        let raw = Bytes::from_static(br#"{"model":"m",  "messages":[{"role":"user","content":"x"}]}"#);
        let body = build_request_body(
            adaptor.as_ref(),
            &meta,
            &normalized(std::str::from_utf8(&raw).unwrap(), false),
            &raw,
        )
        .unwrap();
        assert_eq!(body, raw);
    }

    #[test]
    fn test_remapped_model_is_reserialized() {
        let registry = AdaptorRegistry::default();
        let adaptor = registry.adaptor_for(ApiType::OpenAi).unwrap();
        let meta = RelayMeta::new(RelayMode::ChatCompletions, ChannelType::OpenAi);

        let raw = Bytes::from_static(br#"{"model":"gpt-x","messages":[],"custom":1}"#);
        let mut request = normalized(std::str::from_utf8(&raw).unwrap(), true);
        request.request.model = "gpt-x-2024".to_string();

        let body = build_request_body(adaptor.as_ref(), &meta, &request, &raw).unwrap();
        let sent: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(sent["model"], "gpt-x-2024");
        assert_eq!(sent["custom"], 1);
    }

    #[test]
    fn test_field_correction_drops_zero_frequency_penalty() {
        let registry = AdaptorRegistry::default();
        let adaptor = registry.adaptor_for(ApiType::OpenAi).unwrap();
        let meta = RelayMeta::new(RelayMode::ChatCompletions, ChannelType::Baichuan);

        let raw = Bytes::from_static(br#"{"model":"b","messages":[],"frequency_penalty":0}"#);
        let request = normalized(std::str::from_utf8(&raw).unwrap(), false);

        let body = build_request_body(adaptor.as_ref(), &meta, &request, &raw).unwrap();
        let sent: Value = serde_json::from_slice(&body).unwrap();
        assert!(sent.get("frequency_penalty").is_none());
    }

    #[test]
    fn test_unknown_api_type() {
        let registry = AdaptorRegistry::default();
        assert!(registry.supports(ApiType::OpenAi));

        let err = registry.adaptor_for(ApiType::Gemini).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidApiType);
    }
}
