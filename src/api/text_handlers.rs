//! Chat completion API handlers (OpenAI compatible)
//!
//! The handler waits for the first relay event before answering. A failure
//! at that point becomes a plain HTTP error the client can retry; anything
//! later is delivered inside the already-open event stream.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::Utc;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::models::{
    ApiChatCompletionRequest, ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChunkChoice,
    ChunkDelta, ModelInfo, ModelsResponse,
};
use crate::backend::{ChatMessage, StreamEvent, Usage};
use crate::error::{AppError, ErrorBody, ErrorKind, Result};
use crate::relay::RelayStream;
use crate::AppState;

const DONE_SENTINEL: &str = "[DONE]";

/// Create a chat completion
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "Chat",
    request_body = ApiChatCompletionRequest,
    responses(
        (status = 200, description = "Completion, or a `text/event-stream` of `ChatCompletionChunk`s when `stream` is true", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 404, description = "Unknown backend or model", body = ErrorBody),
        (status = 429, description = "Backend saturated, retry after backoff", body = ErrorBody),
        (status = 503, description = "Backend unavailable", body = ErrorBody),
        (status = 504, description = "Backend timed out", body = ErrorBody),
    )
)]
pub async fn chat_completion(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ApiChatCompletionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload.map_err(|rejection| AppError::InvalidRequest(rejection.body_text()))?;
    let request = payload.into_generation_request()?;

    info!(
        alias = ?request.alias(),
        messages = request.messages.len(),
        stream = request.stream,
        "Received chat completion request"
    );

    let backend = state.selector.select(&request)?;

    if let (Some(max_tokens), Some(limit)) = (
        request.sampling.max_tokens,
        backend.descriptor.capabilities.max_context,
    ) {
        if max_tokens > limit {
            return Err(AppError::InvalidRequest(format!(
                "max_tokens {} exceeds the context limit {} of backend '{}'",
                max_tokens, limit, backend.descriptor.name
            )));
        }
    }

    let slot = state.admission.try_admit(&backend.descriptor).await?;

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| backend.descriptor.name.clone());
    let streaming = request.stream;
    let mut relay = state.relay.start(Arc::new(request), backend, slot);

    let first = match relay.next().await {
        Some(StreamEvent::Error(err)) => return Err(AppError::from_kind(err.kind, err.message)),
        Some(event) => event,
        None => {
            return Err(AppError::UpstreamDisconnected(
                "backend stream closed before producing output".to_string(),
            ))
        }
    };

    if streaming {
        Ok(sse_response(first, relay, model))
    } else {
        collect_response(first, relay, model).await
    }
}

fn json_event<T: Serialize>(name: Option<&str>, value: &T) -> Event {
    let event = |name: Option<&str>| match name {
        Some(name) => Event::default().event(name),
        None => Event::default(),
    };
    event(name)
        .json_data(value)
        .unwrap_or_else(|e| event(Some("error")).data(e.to_string()))
}

/// Turns relay events into OpenAI chunk frames
struct ChunkFramer {
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
    usage: Option<Usage>,
}

impl ChunkFramer {
    fn new(id: String, model: String) -> Self {
        Self {
            id,
            created: Utc::now().timestamp(),
            model,
            role_sent: false,
            usage: None,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    fn frame(&mut self, event: StreamEvent) -> Vec<Event> {
        match event {
            StreamEvent::TokenDelta(text) => {
                let role = (!self.role_sent).then(|| "assistant".to_string());
                self.role_sent = true;
                let delta = ChunkDelta {
                    role,
                    content: Some(text),
                };
                vec![json_event(None, &self.chunk(delta, None, None))]
            }
            // Usage rides on the finishing chunk
            StreamEvent::Usage(usage) => {
                self.usage = Some(usage);
                Vec::new()
            }
            StreamEvent::Done { finish_reason } => {
                let usage = self.usage.take();
                vec![
                    json_event(None, &self.chunk(ChunkDelta::default(), Some(finish_reason), usage)),
                    Event::default().data(DONE_SENTINEL),
                ]
            }
            StreamEvent::Error(err) => {
                vec![json_event(Some("error"), &ErrorBody::new(err.kind, err.message))]
            }
        }
    }
}

fn sse_response(first: StreamEvent, relay: RelayStream, model: String) -> Response {
    let mut framer = ChunkFramer::new(format!("chatcmpl-{}", relay.id().simple()), model);
    debug!(request_id = %relay.id(), backend = %relay.backend(), "Streaming response");

    let events = stream::iter([first])
        .chain(relay)
        .flat_map(move |event| stream::iter(framer.frame(event)))
        .map(Ok::<_, Infallible>);

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn collect_response(first: StreamEvent, relay: RelayStream, model: String) -> Result<Response> {
    let id = format!("chatcmpl-{}", relay.id().simple());
    let mut events = stream::iter([first]).chain(relay);

    let mut content = String::new();
    let mut usage = None;
    let mut finish_reason = None;

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::TokenDelta(text) => content.push_str(&text),
            StreamEvent::Usage(u) => usage = Some(u),
            StreamEvent::Done { finish_reason: reason } => {
                finish_reason = Some(reason);
                break;
            }
            StreamEvent::Error(err) => return Err(AppError::from_kind(err.kind, err.message)),
        }
    }

    if finish_reason.is_none() {
        return Err(AppError::from_kind(
            ErrorKind::UpstreamDisconnected,
            "backend stream ended without a completion",
        ));
    }

    Ok(Json(ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage::new("assistant", content),
            finish_reason,
        }],
        usage,
    })
    .into_response())
}

/// List routable models: every backend name and alias
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "Models",
    responses((status = 200, description = "Routable model ids", body = ModelsResponse))
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let snapshot = state.registry.snapshot();
    let created = Utc::now().timestamp();

    let data = snapshot
        .iter()
        .flat_map(|backend| {
            let descriptor = &backend.descriptor;
            let owner = descriptor.name.clone();
            std::iter::once(descriptor.name.clone())
                .chain(
                    descriptor
                        .aliases
                        .iter()
                        .filter(move |alias| **alias != descriptor.name)
                        .cloned(),
                )
                .map(move |id| ModelInfo {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by: owner.clone(),
                })
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}
