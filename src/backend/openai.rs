//! OpenAI-compatible backend client
//!
//! vLLM, TensorRT-LLM and generic OpenAI-style servers all expose
//! `POST /chat/completions` with optional SSE streaming, but differ in path
//! prefix, usage reporting and whether the stream ends with `[DONE]`.
//! [`WireDialect`] captures those differences; everything else is shared.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, StatusCode,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::model_catalog::{is_model_not_found, ModelCatalog};
use crate::backend::sse::SseDecoder;
use crate::backend::text_backend::{
    ChatMessage, EventStream, FailureSeverity, GenerationRequest, ProbeOutcome, StreamError,
    StreamEvent, TextBackend, Usage,
};
use crate::config::{BackendConfig, ProtocolType};
use crate::error::{AppError, ErrorKind, Result};

const DONE_MARKER: &str = "[DONE]";
const MODEL_CATALOG_TTL: Duration = Duration::from_secs(60);

/// Wire-level differences between OpenAI-compatible servers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireDialect {
    /// Prefix between the configured endpoint and `/chat/completions`
    pub api_prefix: &'static str,
    /// Ask for a usage chunk with `stream_options.include_usage`
    pub stream_usage: bool,
    /// A stream is only complete once `[DONE]` arrives
    pub requires_done: bool,
}

impl WireDialect {
    pub fn for_protocol(protocol: ProtocolType) -> Self {
        match protocol {
            ProtocolType::Vllm => Self {
                api_prefix: "/v1",
                stream_usage: true,
                requires_done: true,
            },
            // trtllm-serve rejects unknown stream options and reports usage
            // on the final chunk by itself
            ProtocolType::TensorrtLlm => Self {
                api_prefix: "/v1",
                stream_usage: false,
                requires_done: false,
            },
            // Endpoint already carries the version, e.g. https://host/v1
            ProtocolType::OpenAi => Self {
                api_prefix: "",
                stream_usage: true,
                requires_done: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Chat completion request body sent upstream
#[derive(Debug, Serialize)]
struct UpstreamChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop: &'a [String],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

fn no_stop_sequences(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    delta: Option<UpstreamContent>,
    #[serde(default)]
    message: Option<UpstreamContent>,
    /// Completion-style servers put the fragment here
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl UpstreamChoice {
    fn content(self) -> Option<String> {
        self.delta
            .and_then(|d| d.content)
            .or_else(|| self.message.and_then(|m| m.content))
            .or(self.text)
    }
}

/// One streamed chunk or a whole non-streamed response
#[derive(Debug, Default, Deserialize)]
struct UpstreamCompletion {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl UpstreamCompletion {
    /// In-band error object, as vLLM and OpenAI send it mid-stream
    fn error_message(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            );
        }
        if self.object.as_deref() == Some("error") {
            return Some(self.message.clone().unwrap_or_else(|| "backend error".to_string()));
        }
        None
    }
}

/// Normalized events from one chunk, plus the finish reason if it carried one
fn chunk_events(completion: UpstreamCompletion, out: &mut VecDeque<StreamEvent>) -> Option<String> {
    let mut finish_reason = None;
    let usage = completion.usage;

    // Only the first choice is relayed; n > 1 is not part of the client contract
    if let Some(choice) = completion.choices.into_iter().next() {
        finish_reason = choice.finish_reason.clone().filter(|r| !r.is_empty());
        if let Some(text) = choice.content().filter(|t| !t.is_empty()) {
            out.push_back(StreamEvent::TokenDelta(text));
        }
    }
    if let Some(usage) = usage {
        out.push_back(StreamEvent::Usage(usage));
    }
    finish_reason
}

fn status_error(status: StatusCode, body: &str) -> StreamError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error").unwrap_or(&v);
            error
                .get("message")
                .or_else(|| error.get("detail"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    let message = format!("Backend returned {}: {}", status, detail);

    match status.as_u16() {
        400 | 404 | 413 | 422 => {
            StreamError::new(ErrorKind::InvalidRequest, message, FailureSeverity::None)
        }
        429 => StreamError::new(ErrorKind::BackendSaturated, message, FailureSeverity::None),
        s if s >= 500 => {
            StreamError::new(ErrorKind::UpstreamError, message, FailureSeverity::Transient)
        }
        _ => StreamError::new(ErrorKind::UpstreamError, message, FailureSeverity::None),
    }
}

fn transport_error(e: &reqwest::Error) -> StreamError {
    if e.is_connect() {
        StreamError::new(
            ErrorKind::NoBackendAvailable,
            format!("Failed to connect to backend: {}", e),
            FailureSeverity::Fatal,
        )
    } else if e.is_timeout() {
        StreamError::timeout(format!("Backend request timed out: {}", e))
    } else {
        StreamError::disconnected(format!("Backend connection failed: {}", e))
    }
}

struct Inner {
    name: String,
    protocol: ProtocolType,
    dialect: WireDialect,
    client: Client,
    endpoint: String,
    health_check_path: String,
    served_model: Option<String>,
    supports_streaming: bool,
    headers: HeaderMap,
    catalog: ModelCatalog,
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.endpoint.trim_end_matches('/'),
            self.dialect.api_prefix,
            path
        )
    }

    async fn fetch_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }
        #[derive(Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelEntry>,
        }

        let response = self
            .client
            .get(self.url("/models"))
            .headers(self.headers.clone())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::UpstreamError(format!(
                "Model listing returned {}",
                response.status()
            )));
        }

        let list = response.json::<ModelList>().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// Upstream model hint: the client's model unless it only named this backend
    fn requested_model<'a>(&self, request: &'a GenerationRequest) -> Option<&'a str> {
        request.model.as_deref().filter(|m| *m != self.name)
    }

    async fn resolve_model(&self, request: &GenerationRequest, force_refresh: bool) -> Option<String> {
        self.catalog
            .refresh(force_refresh, self.fetch_models())
            .await;
        self.catalog
            .resolve(self.requested_model(request), self.served_model.as_deref())
    }
}

enum Phase {
    Connect { model_retry: bool },
    Streaming {
        body: BoxStream<'static, reqwest::Result<Bytes>>,
        decoder: SseDecoder,
        finish_reason: Option<String>,
    },
    Finished,
}

struct StreamState {
    inner: Arc<Inner>,
    request: Arc<GenerationRequest>,
    phase: Phase,
    pending: VecDeque<StreamEvent>,
}

impl StreamState {
    fn fail(&mut self, error: StreamError) {
        self.pending.push_back(StreamEvent::Error(error));
        self.phase = Phase::Finished;
    }

    async fn connect(&mut self, model_retry: bool) {
        let inner = self.inner.clone();
        let request = self.request.clone();
        let upstream_stream = request.stream && inner.supports_streaming;
        let model = inner.resolve_model(&request, false).await;

        let body = UpstreamChatRequest {
            model: model.clone(),
            messages: &request.messages,
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            max_tokens: request.sampling.max_tokens,
            stop: &request.sampling.stop,
            stream: upstream_stream,
            stream_options: (upstream_stream && inner.dialect.stream_usage)
                .then_some(StreamOptions { include_usage: true }),
        };

        debug!(
            backend = %inner.name,
            model = ?model,
            stream = upstream_stream,
            "Sending chat completion request"
        );

        let response = match inner
            .client
            .post(inner.url("/chat/completions"))
            .headers(inner.headers.clone())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return self.fail(transport_error(&e)),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let retry_model = status == StatusCode::NOT_FOUND
                && !model_retry
                && serde_json::from_str::<serde_json::Value>(&text)
                    .map(|v| is_model_not_found(&v))
                    .unwrap_or(false);

            if retry_model {
                let refreshed = inner.resolve_model(&request, true).await;
                if refreshed.is_some() && refreshed != model {
                    warn!(
                        backend = %inner.name,
                        from = ?model,
                        to = ?refreshed,
                        "Backend did not know the model, retrying with refreshed id"
                    );
                    self.phase = Phase::Connect { model_retry: true };
                    return;
                }
            }
            return self.fail(status_error(status, &text));
        }

        if upstream_stream {
            self.phase = Phase::Streaming {
                body: response.bytes_stream().boxed(),
                decoder: SseDecoder::new(),
                finish_reason: None,
            };
            return;
        }

        let completion = match response.bytes().await {
            Ok(bytes) => match serde_json::from_slice::<UpstreamCompletion>(&bytes) {
                Ok(completion) => completion,
                Err(e) => {
                    return self.fail(StreamError::new(
                        ErrorKind::UpstreamError,
                        format!("Failed to parse response: {}", e),
                        FailureSeverity::Transient,
                    ))
                }
            },
            Err(e) => return self.fail(transport_error(&e)),
        };

        if let Some(message) = completion.error_message() {
            return self.fail(StreamError::new(
                ErrorKind::UpstreamError,
                message,
                FailureSeverity::Transient,
            ));
        }

        let finish_reason = chunk_events(completion, &mut self.pending);
        self.pending.push_back(StreamEvent::Done {
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
        });
        self.phase = Phase::Finished;
    }

    /// Turn decoded SSE payloads into events. Returns true once the stream is complete.
    fn consume_payloads(&mut self, payloads: Vec<String>, finish_reason: &mut Option<String>) -> bool {
        for payload in payloads {
            if payload.trim() == DONE_MARKER {
                self.pending.push_back(StreamEvent::Done {
                    finish_reason: finish_reason.take().unwrap_or_else(|| "stop".to_string()),
                });
                return true;
            }

            let completion = match serde_json::from_str::<UpstreamCompletion>(&payload) {
                Ok(completion) => completion,
                Err(e) => {
                    warn!(
                        backend = %self.inner.name,
                        error = %e,
                        payload = %payload,
                        "Skipping unparseable stream chunk"
                    );
                    continue;
                }
            };

            if let Some(message) = completion.error_message() {
                self.pending.push_back(StreamEvent::Error(StreamError::new(
                    ErrorKind::UpstreamError,
                    message,
                    FailureSeverity::Transient,
                )));
                return true;
            }

            if let Some(reason) = chunk_events(completion, &mut self.pending) {
                *finish_reason = Some(reason);
            }
        }
        false
    }

    async fn advance(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Connect { model_retry } => self.connect(model_retry).await,
            Phase::Streaming {
                mut body,
                mut decoder,
                mut finish_reason,
            } => match body.next().await {
                Some(Ok(chunk)) => {
                    let payloads = decoder.push(&chunk);
                    if !self.consume_payloads(payloads, &mut finish_reason) {
                        self.phase = Phase::Streaming {
                            body,
                            decoder,
                            finish_reason,
                        };
                    }
                }
                Some(Err(e)) => {
                    warn!(backend = %self.inner.name, error = %e, "Upstream stream interrupted");
                    self.pending.push_back(StreamEvent::Error(StreamError::disconnected(
                        format!("Backend connection dropped mid-stream: {}", e),
                    )));
                }
                None => {
                    let tail: Vec<String> = decoder.finish().into_iter().collect();
                    if self.consume_payloads(tail, &mut finish_reason) {
                        return;
                    }
                    // Only dialects without [DONE] may end on a finish reason
                    match finish_reason {
                        Some(reason) if !self.inner.dialect.requires_done => {
                            self.pending.push_back(StreamEvent::Done {
                                finish_reason: reason,
                            })
                        }
                        Some(_) => {
                            warn!(backend = %self.inner.name, "Stream closed before [DONE]");
                            self.pending.push_back(StreamEvent::Error(StreamError::disconnected(
                                "Backend closed the stream before [DONE]",
                            )))
                        }
                        None => self.pending.push_back(StreamEvent::Error(
                            StreamError::disconnected("Backend closed the stream before completing"),
                        )),
                    }
                }
            },
            Phase::Finished => {}
        }
    }
}

/// OpenAI API compatible text backend
pub struct OpenAICompatibleBackend {
    inner: Arc<Inner>,
}

impl OpenAICompatibleBackend {
    /// Create a new OpenAI compatible backend
    pub fn new(config: &BackendConfig, dialect: WireDialect) -> Result<Self> {
        // No overall timeout: streams are bounded by the relay's deadlines
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let auth_token = match &config.auth.token_env {
            Some(token_env) => std::env::var(token_env).ok(),
            None => config.auth.api_key.clone(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                protocol: config.protocol,
                dialect,
                client,
                endpoint: config.endpoint.clone(),
                health_check_path: config.health_check_path.clone(),
                served_model: config.served_model.clone(),
                supports_streaming: config.supports_streaming,
                headers: build_headers(auth_token.as_deref(), config.auth.header_name.as_deref()),
                catalog: ModelCatalog::new(config.name.clone(), MODEL_CATALOG_TTL),
            }),
        })
    }
}

/// Get headers with authentication
fn build_headers(token: Option<&str>, header_name: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(token) = token {
        match header_name {
            Some(header_name) => {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(header_name.as_bytes()),
                    HeaderValue::from_str(token),
                ) {
                    headers.insert(name, value);
                }
            }
            None => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
    }

    headers
}

#[async_trait]
impl TextBackend for OpenAICompatibleBackend {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn protocol(&self) -> &str {
        match self.inner.protocol {
            ProtocolType::Vllm => "vllm",
            ProtocolType::TensorrtLlm => "tensorrt-llm",
            ProtocolType::OpenAi => "openai",
        }
    }

    fn open_stream(&self, request: Arc<GenerationRequest>) -> EventStream {
        let state = StreamState {
            inner: self.inner.clone(),
            request,
            phase: Phase::Connect { model_retry: false },
            pending: VecDeque::new(),
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if matches!(state.phase, Phase::Finished) {
                    return None;
                }
                state.advance().await;
            }
        })
        .boxed()
    }

    async fn probe(&self) -> ProbeOutcome {
        let url = format!(
            "{}{}",
            self.inner.endpoint.trim_end_matches('/'),
            self.inner.health_check_path
        );

        match self
            .inner
            .client
            .get(&url)
            .headers(self.inner.headers.clone())
            .send()
            .await
        {
            // 401 means the server is up but wants credentials
            Ok(response)
                if response.status().is_success()
                    || response.status() == StatusCode::UNAUTHORIZED =>
            {
                ProbeOutcome::Healthy
            }
            Ok(response) => ProbeOutcome::Unhealthy(format!("status {}", response.status())),
            Err(e) if e.is_connect() => ProbeOutcome::Unreachable(e.to_string()),
            Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.inner.catalog.refresh(false, self.inner.fetch_models()).await;
        Ok(self.inner.catalog.models())
    }
}
