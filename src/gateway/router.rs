//! Backend selection
//!
//! The selector never substitutes one backend for another: an explicit alias
//! or the configured default either resolves to a usable backend or the
//! request fails.

use std::sync::Arc;
use tracing::debug;

use crate::backend::{BackendRegistry, GenerationRequest, RegisteredBackend, RegistrySnapshot};
use crate::error::{AppError, Result};
use crate::gateway::health_check::{HealthStatus, HealthTracker};

/// Chooses the target backend for a request
pub struct BackendSelector {
    registry: Arc<BackendRegistry>,
    health: Arc<HealthTracker>,
}

impl BackendSelector {
    pub fn new(registry: Arc<BackendRegistry>, health: Arc<HealthTracker>) -> Self {
        Self { registry, health }
    }

    /// Resolve the backend for `request`.
    ///
    /// Order: explicit alias, configured default, then the first backend in
    /// name order that fits the requested token budget, Degraded ones last.
    pub fn select(&self, request: &GenerationRequest) -> Result<RegisteredBackend> {
        let snapshot = self.registry.snapshot();

        let backend = if let Some(alias) = request.alias() {
            snapshot
                .resolve(alias)
                .cloned()
                .ok_or_else(|| AppError::UnknownBackend(format!("'{}' is not a registered backend or model", alias)))?
        } else if let Some(default) = snapshot.default_backend() {
            snapshot.get(default).cloned().ok_or_else(|| {
                AppError::Internal(format!("default backend '{}' is not registered", default))
            })?
        } else {
            return self.capability_match(&snapshot, request);
        };

        let name = &backend.descriptor.name;
        if self.health.status(name) == HealthStatus::Unavailable {
            return Err(AppError::NoBackendAvailable(format!(
                "backend '{}' is unavailable",
                name
            )));
        }

        debug!(backend = %name, alias = ?request.alias(), "Selected backend");
        Ok(backend)
    }

    fn capability_match(
        &self,
        snapshot: &RegistrySnapshot,
        request: &GenerationRequest,
    ) -> Result<RegisteredBackend> {
        if snapshot.is_empty() {
            return Err(AppError::NoBackendAvailable(
                "no backends are registered".to_string(),
            ));
        }

        let wanted = request.sampling.max_tokens;
        snapshot
            .iter()
            .filter_map(|b| match self.health.status(&b.descriptor.name) {
                HealthStatus::Unavailable => None,
                HealthStatus::Degraded => Some((1, b)),
                HealthStatus::Unknown | HealthStatus::Healthy => Some((0, b)),
            })
            .filter(|(_, b)| match (wanted, b.descriptor.capabilities.max_context) {
                (Some(wanted), Some(limit)) => wanted <= limit,
                _ => true,
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, b)| b.clone())
            .map(|backend| {
                debug!(backend = %backend.descriptor.name, "Selected backend by capability");
                backend
            })
            .ok_or_else(|| {
                AppError::NoBackendAvailable("no healthy backend can serve this request".to_string())
            })
    }
}
