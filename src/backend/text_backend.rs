//! Gateway-internal generation types and the backend client contract
//!
//! Every backend, whatever wire format it speaks, is driven through
//! [`TextBackend::open_stream`] and answers with a sequence of [`StreamEvent`]s.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::backend::openai::{OpenAICompatibleBackend, WireDialect};
use crate::config::BackendConfig;
use crate::error::{ErrorKind, Result};

/// Chat message for completion requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }
}

/// Sampling parameters forwarded to the backend untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
}

/// A validated chat-completion request. Immutable once accepted.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
    pub stream: bool,
    /// Model id or alias as sent by the client
    pub model: Option<String>,
    /// Explicit backend selector, takes precedence over `model`
    pub backend: Option<String>,
}

impl GenerationRequest {
    /// The alias used for routing, if the client named one
    pub fn alias(&self) -> Option<&str> {
        self.backend
            .as_deref()
            .or(self.model.as_deref())
            .filter(|alias| !alias.is_empty())
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// How a failure should count against the backend's health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    /// The backend is fine, the request was at fault
    None,
    /// Counts towards the consecutive-failure thresholds
    Transient,
    /// The backend cannot be reached at all
    Fatal,
}

/// Error carried inside a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
    pub severity: FailureSeverity,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, severity: FailureSeverity) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::UpstreamDisconnected,
            message,
            FailureSeverity::Transient,
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTimeout, message, FailureSeverity::Transient)
    }
}

/// One unit of normalized backend output
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TokenDelta(String),
    Usage(Usage),
    Done { finish_reason: String },
    Error(StreamError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error(_))
    }
}

/// Finite, non-restartable sequence of backend events
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Result of a health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
    /// Connection refused or similar; the backend is not running
    Unreachable(String),
}

/// Trait for text generation backends
#[async_trait]
pub trait TextBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Get the backend protocol
    fn protocol(&self) -> &str;

    /// Open an upstream generation. Nothing is sent until the stream is polled;
    /// dropping the stream aborts the upstream call.
    ///
    /// Backend-reported failures surface as a terminal [`StreamEvent::Error`].
    /// A non-streamed upstream call yields one `TokenDelta` with the full text.
    fn open_stream(&self, request: Arc<GenerationRequest>) -> EventStream;

    /// Low-cost liveness probe
    async fn probe(&self) -> ProbeOutcome;

    /// Model ids served by the backend
    async fn list_models(&self) -> Result<Vec<String>>;
}

/// Create appropriate text backend based on configuration
pub fn create_text_backend(config: &BackendConfig) -> Result<Arc<dyn TextBackend>> {
    let dialect = WireDialect::for_protocol(config.protocol);
    Ok(Arc::new(OpenAICompatibleBackend::new(config, dialect)?))
}
