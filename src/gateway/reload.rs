//! Hot reload of the backend table
//!
//! A reload builds a complete new registry snapshot first. Only when that
//! succeeds is anything swapped, so a bad configuration file leaves the
//! running gateway untouched. Requests already in flight keep the client and
//! admission slot they were admitted with.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::RegistrySnapshot;
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::gateway::health_check::HealthPolicy;
use crate::AppState;

/// Re-read the configuration files the gateway was started with and apply them
pub async fn reload(state: &AppState) -> Result<Arc<RegistrySnapshot>> {
    let paths = state.config_paths.clone().ok_or_else(|| {
        AppError::InvalidRequest("the gateway was not started from configuration files".to_string())
    })?;

    let settings = tokio::task::spawn_blocking(move || Settings::load(&paths))
        .await
        .map_err(|e| AppError::Internal(format!("configuration loader failed: {}", e)))??;

    apply_settings(state, settings).await
}

/// Swap in new settings
pub async fn apply_settings(state: &AppState, settings: Settings) -> Result<Arc<RegistrySnapshot>> {
    let _serialized = state.reload_lock.lock().await;

    settings.validate()?;
    let snapshot = RegistrySnapshot::from_settings(&settings)?;

    let mut current = state.settings.write().await;
    if current.admission.global_max_in_flight != settings.admission.global_max_in_flight {
        warn!(
            running = current.admission.global_max_in_flight,
            configured = settings.admission.global_max_in_flight,
            "global_max_in_flight only changes on restart"
        );
    }
    if current.health.probe_interval_secs != settings.health.probe_interval_secs {
        warn!("health.probe_interval_secs only changes on restart");
    }

    let previous = state.registry.replace(snapshot);
    let snapshot = state.registry.snapshot();

    state
        .admission
        .sync(snapshot.iter().map(|backend| backend.descriptor.as_ref()));
    state.health.set_policy(HealthPolicy::from(&settings.health));
    state.health.sync_backends(&snapshot.names());
    state.health_manager.set_config(settings.health.clone());
    state.relay.set_config(settings.relay.clone());

    let removed: Vec<String> = previous
        .names()
        .into_iter()
        .filter(|name| snapshot.get(name).is_none())
        .collect();
    info!(
        backends = ?snapshot.names(),
        removed = ?removed,
        default_backend = ?snapshot.default_backend(),
        "Configuration reloaded"
    );

    *current = settings;
    Ok(snapshot)
}
