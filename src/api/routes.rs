//! HTTP route definitions

use crate::api::handlers;
use crate::api::models::*;
use crate::api::text_handlers;
use crate::backend::{Capabilities, ChatMessage, Usage};
use crate::error::{ErrorBody, ErrorDetail, ErrorKind};
use crate::gateway::{BackendHealthState, HealthStatus, HealthSummary};
use crate::queue::AdmissionStats;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "LLM Stream Gateway API",
        version = "0.1.0",
        description = "OpenAI-compatible chat completions relayed to vLLM, TensorRT-LLM and other OpenAI-style backends.",
        license(name = "MIT"),
    ),
    paths(
        text_handlers::chat_completion,
        text_handlers::list_models,
        handlers::list_backends,
        handlers::reload_config,
        handlers::health_check,
    ),
    components(schemas(
        ApiChatCompletionRequest,
        StopSequences,
        ChatMessage,
        ChatCompletionResponse,
        ChatChoice,
        ChatCompletionChunk,
        ChunkChoice,
        ChunkDelta,
        Usage,
        ModelsResponse,
        ModelInfo,
        BackendInfo,
        BackendListResponse,
        Capabilities,
        BackendHealthState,
        HealthStatus,
        AdmissionStats,
        HealthResponse,
        HealthSummary,
        ReloadResponse,
        ErrorBody,
        ErrorDetail,
        ErrorKind,
    )),
    tags(
        (name = "Chat", description = "Chat completion endpoints"),
        (name = "Models", description = "Model discovery"),
        (name = "Backends", description = "Backend management endpoints"),
        (name = "Health", description = "Health and monitoring endpoints"),
    )
)]
pub struct ApiDoc;

/// Create the main application router
pub fn create_router(state: Arc<crate::AppState>) -> Router {
    let api_routes = Router::new()
        .route("/chat/completions", post(text_handlers::chat_completion))
        .route("/models", get(text_handlers::list_models))
        .route("/backends", get(handlers::list_backends))
        .route("/admin/reload", post(handlers::reload_config));

    Router::new()
        // Health check endpoint
        .route("/health", get(handlers::health_check))
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // API routes under /v1 prefix
        .nest("/v1", api_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
