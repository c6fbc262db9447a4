//! Management and health HTTP handlers

use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::api::models::{BackendInfo, BackendListResponse, HealthResponse, ReloadResponse};
use crate::error::{ErrorBody, Result};
use crate::gateway::reload;
use crate::AppState;

/// List all registered backends with health and admission state
#[utoipa::path(
    get,
    path = "/v1/backends",
    tag = "Backends",
    responses((status = 200, description = "Registered backends", body = BackendListResponse))
)]
pub async fn list_backends(State(state): State<Arc<AppState>>) -> Json<BackendListResponse> {
    let snapshot = state.registry.snapshot();

    let backends = snapshot
        .iter()
        .map(|backend| {
            let descriptor = &backend.descriptor;
            BackendInfo {
                name: descriptor.name.clone(),
                protocol: descriptor.protocol.to_string(),
                endpoint: descriptor.endpoint.clone(),
                aliases: descriptor.aliases.clone(),
                capabilities: descriptor.capabilities,
                health: state.health.state(&descriptor.name).unwrap_or_default(),
                admission: state.admission.stats(&descriptor.name).unwrap_or_default(),
            }
        })
        .collect();

    Json(BackendListResponse {
        default_backend: snapshot.default_backend().map(str::to_string),
        backends,
    })
}

/// Re-read configuration and replace the backend table
#[utoipa::path(
    post,
    path = "/v1/admin/reload",
    tag = "Backends",
    responses(
        (status = 200, description = "Configuration applied", body = ReloadResponse),
        (status = 400, description = "Reload not possible", body = ErrorBody),
        (status = 500, description = "New configuration rejected; the old one stays active", body = ErrorBody),
    )
)]
pub async fn reload_config(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>> {
    info!("Reloading configuration");
    let snapshot = reload::reload(&state).await?;

    Ok(Json(ReloadResponse {
        success: true,
        backends: snapshot.names(),
        default_backend: snapshot.default_backend().map(str::to_string),
    }))
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Gateway is up", body = HealthResponse))
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let summary = state.health_manager.summary();
    let status = if summary.degraded + summary.unavailable > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        in_flight: state.admission.total_in_flight(),
        backends: summary,
    })
}
