//! Relay error types.
//!
//! Every failure a relay call can produce is a [`RelayError`]. Each variant
//! carries a machine-readable [`ErrorKind`] and an HTTP status so the HTTP
//! surface can render it as an OpenAI-style error envelope without knowing
//! where the failure originated.
//!
//! The variants map onto the billing protocol:
//!
//! | Variant                | Quota effect                              |
//! |------------------------|-------------------------------------------|
//! | `InvalidRequest`       | none, raised before any reservation       |
//! | `InsufficientBalance`  | none, reservation refused                 |
//! | `UnsupportedFeature`   | reservation released                      |
//! | `UpstreamUnreachable`  | reservation released                      |
//! | `UpstreamTimeout`      | reservation released                      |
//! | `UpstreamApplication`  | reservation released                      |
//! | `Settlement`           | logged only, client already answered      |

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay errors.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Inbound request is malformed or uses an unsupported mode.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No adaptor is registered for the channel's API family.
    #[error("Invalid api type: {0}")]
    InvalidApiType(String),

    /// The account cannot cover the reservation.
    #[error("Insufficient balance: account {account} needs {required}, has {available}")]
    InsufficientBalance {
        /// Account the reservation was attempted against.
        account: String,
        /// Quota the reservation asked for.
        required: i64,
        /// Balance at the time of the attempt.
        available: i64,
    },

    /// The adaptor cannot express the request for its backend family.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Transport-level failure reaching the backend.
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The backend did not answer in time.
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The backend answered with an application-level error.
    #[error("Upstream error ({status}): {message}")]
    UpstreamApplication {
        /// Status reported by the backend.
        status: u16,
        /// Backend's error message, or the raw body when none was parsed.
        message: String,
        /// Backend's error code when the envelope carried one.
        code: Option<String>,
    },

    /// The client went away while the response was being written.
    #[error("Client closed connection: {0}")]
    ClientClosed(String),

    /// Post-response reconciliation with the ledger failed.
    #[error("Settlement failed: {0}")]
    Settlement(String),

    /// Ledger was asked to release or settle a reservation it does not hold.
    #[error("Unknown reservation: {0}")]
    UnknownReservation(String),

    /// No account matches the presented credentials.
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// No channel serves the requested model.
    #[error("No available channel for model: {0}")]
    NoChannel(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unsupported input.
    InvalidRequest,
    /// No adaptor for the API family.
    InvalidApiType,
    /// Reservation refused.
    InsufficientUserQuota,
    /// Adaptor cannot express the request.
    UnsupportedFeature,
    /// Transport failure.
    UpstreamUnreachable,
    /// Transport timeout.
    UpstreamTimeout,
    /// Backend application error.
    UpstreamError,
    /// Client disconnected mid-response.
    ClientClosed,
    /// Ledger reconciliation failed.
    SettlementFailure,
    /// Reservation handle not recognised.
    UnknownReservation,
    /// Credentials not recognised.
    UnknownAccount,
    /// No channel for the model.
    ModelNotAvailable,
    /// Bad configuration.
    ConfigError,
    /// Bad JSON.
    JsonError,
    /// I/O failure.
    IoError,
}

impl ErrorKind {
    /// Snake-case code used in error envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidApiType => "invalid_api_type",
            Self::InsufficientUserQuota => "insufficient_user_quota",
            Self::UnsupportedFeature => "unsupported_feature",
            Self::UpstreamUnreachable => "upstream_unreachable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamError => "upstream_error",
            Self::ClientClosed => "client_closed",
            Self::SettlementFailure => "settlement_failure",
            Self::UnknownReservation => "unknown_reservation",
            Self::UnknownAccount => "unknown_account",
            Self::ModelNotAvailable => "model_not_available",
            Self::ConfigError => "config_error",
            Self::JsonError => "json_error",
            Self::IoError => "io_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RelayError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::InvalidApiType(_) => ErrorKind::InvalidApiType,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientUserQuota,
            Self::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
            Self::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
            Self::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            Self::UpstreamApplication { .. } => ErrorKind::UpstreamError,
            Self::ClientClosed(_) => ErrorKind::ClientClosed,
            Self::Settlement(_) => ErrorKind::SettlementFailure,
            Self::UnknownReservation(_) => ErrorKind::UnknownReservation,
            Self::UnknownAccount(_) => ErrorKind::UnknownAccount,
            Self::NoChannel(_) => ErrorKind::ModelNotAvailable,
            Self::Config(_) => ErrorKind::ConfigError,
            Self::Json(_) => ErrorKind::JsonError,
            Self::Io(_) => ErrorKind::IoError,
        }
    }

    /// HTTP status equivalent.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidApiType(_)
            | Self::UnsupportedFeature(_)
            | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientBalance { .. } => StatusCode::FORBIDDEN,
            Self::UnknownAccount(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamApplication { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            },
            // nginx's "client closed request"
            Self::ClientClosed(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            },
            Self::NoChannel(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Settlement(_)
            | Self::UnknownReservation(_)
            | Self::Config(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error happened after the backend was contacted.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnreachable(_)
                | Self::UpstreamTimeout(_)
                | Self::UpstreamApplication { .. }
        )
    }

    /// Render as the structured error returned to clients.
    pub fn to_structured(&self) -> StructuredError {
        let (message, code) = match self {
            Self::UpstreamApplication { message, code, .. } => (
                message.clone(),
                code.clone().unwrap_or_else(|| self.kind().as_str().to_string()),
            ),
            other => (other.to_string(), other.kind().as_str().to_string()),
        };

        StructuredError {
            status: self.status().as_u16(),
            kind: self.kind(),
            message,
            code,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::UpstreamTimeout(err.to_string())
        } else {
            RelayError::UpstreamUnreachable(err.to_string())
        }
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

/// Error as seen by the client: status, kind and a human message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredError {
    /// HTTP status code.
    pub status: u16,
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Code placed in the envelope; the backend's own when relayed.
    pub code: String,
}

/// OpenAI-compatible error envelope body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Inner error object.
    pub error: ErrorBody,
}

/// Inner object of [`ErrorEnvelope`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Error type, e.g. `invalid_request_error`.
    #[serde(default, rename = "type")]
    pub error_type: String,
    /// Offending parameter, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Error code; backends send strings or numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

impl StructuredError {
    /// Envelope body for this error.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: "relay_error".to_string(),
                param: None,
                code: Some(serde_json::Value::String(self.code.clone())),
            },
        }
    }
}

impl IntoResponse for StructuredError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.envelope())).into_response()
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.to_structured().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_mapping() {
        let err = RelayError::InsufficientBalance {
            account: "acct".to_string(),
            required: 100,
            available: 10,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientUserQuota);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);

        let err = RelayError::UpstreamTimeout("slow".to_string());
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(err.is_upstream());

        let err = RelayError::InvalidRequest("model is required".to_string());
        assert!(!err.is_upstream());
        assert_eq!(err.kind().as_str(), "invalid_request");
    }

    #[test]
    fn test_upstream_application_keeps_backend_status_and_message() {
        let err = RelayError::UpstreamApplication {
            status: 429,
            message: "Rate limit reached".to_string(),
            code: Some("rate_limit_exceeded".to_string()),
        };

        let structured = err.to_structured();
        assert_eq!(structured.status, 429);
        assert_eq!(structured.message, "Rate limit reached");
        assert_eq!(structured.code, "rate_limit_exceeded");
        assert_eq!(structured.kind, ErrorKind::UpstreamError);
    }

    #[test]
    fn test_envelope_shape() {
        let structured = RelayError::InvalidRequest("field messages is required".to_string())
            .to_structured();
        let json = serde_json::to_value(structured.envelope()).unwrap();

        assert_eq!(json["error"]["type"], "relay_error");
        assert_eq!(json["error"]["code"], "invalid_request");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("field messages is required"));
    }

    #[test]
    fn test_client_closed_status() {
        let err = RelayError::ClientClosed("receiver dropped".to_string());
        assert_eq!(err.status().as_u16(), 499);
    }
}
