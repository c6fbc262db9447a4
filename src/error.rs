//! Error types and HTTP error mapping

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Machine-readable error kind shared by synchronous errors and stream error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request named a backend or model alias that is not registered
    UnknownBackend,
    /// The resolved backend is unavailable
    NoBackendAvailable,
    /// The backend's admission limit and queue are full
    BackendSaturated,
    /// The upstream connection dropped mid-stream
    UpstreamDisconnected,
    /// No progress from the backend within the deadline
    UpstreamTimeout,
    /// Malformed client input
    InvalidRequest,
    /// The backend reported a failure of its own
    UpstreamError,
    /// Gateway bug or misconfiguration
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownBackend => "unknown_backend",
            ErrorKind::NoBackendAvailable => "no_backend_available",
            ErrorKind::BackendSaturated => "backend_saturated",
            ErrorKind::UpstreamDisconnected => "upstream_disconnected",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status used when the error is returned before a stream is committed
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::UnknownBackend => StatusCode::NOT_FOUND,
            ErrorKind::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::BackendSaturated => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamDisconnected => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a client may safely retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoBackendAvailable
                | ErrorKind::BackendSaturated
                | ErrorKind::UpstreamDisconnected
                | ErrorKind::UpstreamTimeout
                | ErrorKind::UpstreamError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("No backend available: {0}")]
    NoBackendAvailable(String),

    #[error("Backend saturated: {0}")]
    BackendSaturated(String),

    #[error("Upstream disconnected: {0}")]
    UpstreamDisconnected(String),

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend error: {0}")]
    UpstreamError(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Build an error of the given kind
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::UnknownBackend => AppError::UnknownBackend(message),
            ErrorKind::NoBackendAvailable => AppError::NoBackendAvailable(message),
            ErrorKind::BackendSaturated => AppError::BackendSaturated(message),
            ErrorKind::UpstreamDisconnected => AppError::UpstreamDisconnected(message),
            ErrorKind::UpstreamTimeout => AppError::UpstreamTimeout(message),
            ErrorKind::InvalidRequest => AppError::InvalidRequest(message),
            ErrorKind::UpstreamError => AppError::UpstreamError(message),
            ErrorKind::Internal => AppError::Internal(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) | AppError::Internal(_) => ErrorKind::Internal,
            AppError::UnknownBackend(_) => ErrorKind::UnknownBackend,
            AppError::NoBackendAvailable(_) => ErrorKind::NoBackendAvailable,
            AppError::BackendSaturated(_) => ErrorKind::BackendSaturated,
            AppError::UpstreamDisconnected(_) => ErrorKind::UpstreamDisconnected,
            AppError::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            AppError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            AppError::UpstreamError(_) | AppError::HttpClient(_) => ErrorKind::UpstreamError,
        }
    }

    /// Message without the kind prefix added by `Display`
    pub fn message(&self) -> String {
        match self {
            AppError::Config(e) => e.to_string(),
            AppError::HttpClient(e) => e.to_string(),
            AppError::UnknownBackend(m)
            | AppError::NoBackendAvailable(m)
            | AppError::BackendSaturated(m)
            | AppError::UpstreamDisconnected(m)
            | AppError::UpstreamTimeout(m)
            | AppError::InvalidRequest(m)
            | AppError::UpstreamError(m)
            | AppError::Internal(m) => m.clone(),
        }
    }
}

/// Error body returned to clients, both as JSON responses and SSE error frames
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind,
                message: message.into(),
                retryable: kind.is_retryable(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = match &self {
            // Config details stay in the logs
            AppError::Config(e) => {
                tracing::error!(error = %e, "Configuration error while serving request");
                "gateway configuration error".to_string()
            }
            _ => self.message(),
        };

        let mut response = (kind.status_code(), Json(ErrorBody::new(kind, message))).into_response();
        if kind == ErrorKind::BackendSaturated {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;
