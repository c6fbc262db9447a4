//! Cached list of model ids served by a backend
//!
//! Clients and configuration name models loosely; the catalog maps the
//! requested id onto one the backend actually serves, so a stale default
//! does not turn into an upstream 404.

use parking_lot::RwLock;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Default)]
struct CatalogState {
    models: Vec<String>,
    fetched_at: Option<Instant>,
}

/// Model-id cache with a time-to-live
#[derive(Debug)]
pub struct ModelCatalog {
    backend: String,
    ttl: Duration,
    state: RwLock<CatalogState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ModelCatalog {
    pub fn new(backend: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend: backend.into(),
            ttl,
            state: RwLock::new(CatalogState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn models(&self) -> Vec<String> {
        self.state.read().models.clone()
    }

    fn is_fresh(&self) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        self.state
            .read()
            .fetched_at
            .map_or(false, |at| at.elapsed() < self.ttl)
    }

    /// Refresh the cache when stale (or always when `force`). Fetch failures
    /// keep the previous list.
    pub async fn refresh<F>(&self, force: bool, fetch: F)
    where
        F: Future<Output = Result<Vec<String>>>,
    {
        if !force && self.is_fresh() {
            return;
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if !force && self.is_fresh() {
            return;
        }

        match fetch.await {
            Ok(ids) if !ids.is_empty() => {
                debug!(backend = %self.backend, models = ids.len(), "Refreshed model catalog");
                let mut state = self.state.write();
                state.models = ids;
                state.fetched_at = Some(Instant::now());
            }
            Ok(_) => {
                debug!(backend = %self.backend, "Backend listed no models");
                self.state.write().fetched_at = Some(Instant::now());
            }
            Err(e) => {
                warn!(backend = %self.backend, error = %e, "Failed to fetch model list");
                // Back off until the TTL expires; forced refreshes still go through
                self.state.write().fetched_at = Some(Instant::now());
            }
        }
    }

    /// Pick the upstream model id.
    ///
    /// Order: requested if served, default if served, first served id,
    /// then requested or default unverified.
    pub fn resolve(&self, requested: Option<&str>, default: Option<&str>) -> Option<String> {
        let state = self.state.read();
        let served = |candidate: &&str| state.models.iter().any(|m| m == candidate);

        requested
            .filter(served)
            .or_else(|| default.filter(served))
            .map(str::to_string)
            .or_else(|| state.models.first().cloned())
            .or_else(|| requested.or(default).map(str::to_string))
    }
}

/// Whether an upstream 404 body means "model not found"
pub fn is_model_not_found(body: &serde_json::Value) -> bool {
    let error = body.get("error").unwrap_or(body);
    let code_is_404 = error
        .get("code")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        == Some(404);
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_lowercase();

    code_is_404 || message.contains("does not exist") || message.contains("not found")
}
