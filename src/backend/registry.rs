//! Backend descriptor registry
//!
//! The registry is a read-mostly table. Readers take a cheap snapshot; a
//! reload builds a complete new table and swaps it in, so no reader ever
//! sees a half-applied configuration.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::backend::text_backend::{create_text_backend, TextBackend};
use crate::config::{BackendConfig, ProtocolType, Settings};
use crate::error::{AppError, Result};

/// What a backend can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub max_context: Option<u32>,
}

/// Static description of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: String,
    pub endpoint: String,
    pub protocol: ProtocolType,
    pub capabilities: Capabilities,
    pub max_concurrency: usize,
    pub queue_depth: usize,
    pub queue_timeout: Duration,
    pub aliases: Vec<String>,
}

impl BackendDescriptor {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            endpoint: config.endpoint.clone(),
            protocol: config.protocol,
            capabilities: Capabilities {
                supports_streaming: config.supports_streaming,
                max_context: config.max_context,
            },
            max_concurrency: config.max_concurrency,
            queue_depth: config.queue_depth,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
            aliases: config.models.clone(),
        }
    }
}

/// A descriptor together with the client that talks to it
#[derive(Clone)]
pub struct RegisteredBackend {
    pub descriptor: Arc<BackendDescriptor>,
    pub client: Arc<dyn TextBackend>,
}

impl std::fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("descriptor", &self.descriptor)
            .field("client", &self.client.name())
            .finish()
    }
}

/// One immutable version of the backend table
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    backends: BTreeMap<String, RegisteredBackend>,
    aliases: HashMap<String, String>,
    default_backend: Option<String>,
}

impl RegistrySnapshot {
    pub fn new(default_backend: Option<String>) -> Self {
        Self {
            default_backend,
            ..Default::default()
        }
    }

    /// Build a table from configuration, creating one client per enabled backend
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut snapshot = Self::new(settings.routing.default_backend.clone());

        for config in settings.get_enabled_backends() {
            let client = create_text_backend(config)?;
            snapshot.insert(BackendDescriptor::from_config(config), client)?;
        }

        if let Some(default) = &snapshot.default_backend {
            if !snapshot.backends.contains_key(default) {
                return Err(AppError::Config(config::ConfigError::Message(format!(
                    "Default backend '{}' is not registered",
                    default
                ))));
            }
        }

        Ok(snapshot)
    }

    /// Add a backend; names and aliases must be unique across the table
    pub fn insert(
        &mut self,
        descriptor: BackendDescriptor,
        client: Arc<dyn TextBackend>,
    ) -> Result<()> {
        let name = descriptor.name.clone();
        if self.backends.contains_key(&name) || self.aliases.contains_key(&name) {
            return Err(AppError::Config(config::ConfigError::Message(format!(
                "Backend '{}' already exists",
                name
            ))));
        }

        for alias in &descriptor.aliases {
            if alias == &name {
                continue;
            }
            if self.backends.contains_key(alias) {
                return Err(AppError::Config(config::ConfigError::Message(format!(
                    "Alias '{}' of backend '{}' collides with a backend name",
                    alias, name
                ))));
            }
            if let Some(owner) = self.aliases.get(alias) {
                return Err(AppError::Config(config::ConfigError::Message(format!(
                    "Alias '{}' is claimed by both '{}' and '{}'",
                    alias, owner, name
                ))));
            }
        }

        for alias in descriptor.aliases.iter().filter(|a| **a != name) {
            self.aliases.insert(alias.clone(), name.clone());
        }

        self.backends.insert(
            name,
            RegisteredBackend {
                descriptor: Arc::new(descriptor),
                client,
            },
        );
        Ok(())
    }

    /// Get a backend by name
    pub fn get(&self, name: &str) -> Option<&RegisteredBackend> {
        self.backends.get(name)
    }

    /// Look up by backend name first, then by model alias
    pub fn resolve(&self, alias: &str) -> Option<&RegisteredBackend> {
        self.backends.get(alias).or_else(|| {
            self.aliases
                .get(alias)
                .and_then(|name| self.backends.get(name))
        })
    }

    pub fn default_backend(&self) -> Option<&str> {
        self.default_backend.as_deref()
    }

    /// Backends in name order
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Registry for text generation backends
pub struct BackendRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl BackendRegistry {
    /// Create a new empty backend registry
    pub fn new() -> Self {
        Self::with_snapshot(RegistrySnapshot::default())
    }

    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Initialize the registry from configuration
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let snapshot = RegistrySnapshot::from_settings(settings)?;
        for backend in snapshot.iter() {
            info!(
                name = %backend.descriptor.name,
                protocol = %backend.descriptor.protocol,
                endpoint = %backend.descriptor.endpoint,
                max_concurrency = backend.descriptor.max_concurrency,
                "Registered backend"
            );
        }
        Ok(Self::with_snapshot(snapshot))
    }

    /// The current table. Holders keep their version even across reloads.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Swap in a whole new table, returning the previous one
    pub fn replace(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let next = Arc::new(snapshot);
        debug!(backends = next.len(), "Replacing backend table");
        std::mem::replace(&mut *self.current.write(), next)
    }

    /// Get a backend by name
    pub fn get(&self, name: &str) -> Option<RegisteredBackend> {
        self.snapshot().get(name).cloned()
    }

    /// Get the number of registered backends
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Check if a backend exists
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().get(name).is_some()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
