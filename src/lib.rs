//! LLM Stream Gateway
//!
//! A Rust gateway that exposes one OpenAI-compatible chat-completion API in
//! front of several independently running inference backends, relaying their
//! token streams with backpressure, cancellation, admission control and
//! per-backend health tracking.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod relay;

pub use error::{AppError, Result};

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use backend::{BackendRegistry, RegistrySnapshot};
use config::{ConfigPaths, Settings};
use gateway::{BackendSelector, HealthCheckManager, HealthPolicy, HealthTracker};
use queue::AdmissionController;
use relay::StreamRelay;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<RwLock<Settings>>,
    /// Where settings were loaded from; reload is unavailable without them
    pub config_paths: Option<ConfigPaths>,
    pub registry: Arc<BackendRegistry>,
    pub health: Arc<HealthTracker>,
    pub selector: BackendSelector,
    pub admission: Arc<AdmissionController>,
    pub relay: StreamRelay,
    pub health_manager: Arc<HealthCheckManager>,
    pub(crate) reload_lock: Mutex<()>,
}

impl AppState {
    /// Build state from settings, creating one client per enabled backend
    pub fn new(settings: Settings, config_paths: Option<ConfigPaths>) -> Result<Self> {
        let snapshot = RegistrySnapshot::from_settings(&settings)?;
        Ok(Self::with_snapshot(settings, snapshot, config_paths))
    }

    /// Build state around an existing backend table
    pub fn with_snapshot(
        settings: Settings,
        snapshot: RegistrySnapshot,
        config_paths: Option<ConfigPaths>,
    ) -> Self {
        let health = Arc::new(HealthTracker::new(HealthPolicy::from(&settings.health)));
        health.sync_backends(&snapshot.names());

        let admission = Arc::new(AdmissionController::new(
            settings.admission.global_max_in_flight,
        ));
        admission.sync(snapshot.iter().map(|backend| backend.descriptor.as_ref()));

        let registry = Arc::new(BackendRegistry::with_snapshot(snapshot));
        let selector = BackendSelector::new(registry.clone(), health.clone());
        let relay = StreamRelay::new(health.clone(), settings.relay.clone());
        let health_manager = Arc::new(HealthCheckManager::new(
            registry.clone(),
            health.clone(),
            settings.health.clone(),
        ));

        Self {
            settings: Arc::new(RwLock::new(settings)),
            config_paths,
            registry,
            health,
            selector,
            admission,
            relay,
            health_manager,
            reload_lock: Mutex::new(()),
        }
    }
}
