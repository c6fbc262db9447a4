//! Per-backend health tracking and background probing
//!
//! Each backend has its own small lock; recording an outcome for one backend
//! never contends with traffic to another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::backend::{BackendRegistry, FailureSeverity, ProbeOutcome};
use crate::config::HealthConfig;

/// Health status of a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unavailable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Point-in-time view of a backend's health
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct BackendHealthState {
    pub status: HealthStatus,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Thresholds driving the state machine
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub degraded_after: u32,
    pub unavailable_after: u32,
    pub window: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            degraded_after: config.degraded_after,
            unavailable_after: config.unavailable_after.max(config.degraded_after),
            window: Duration::from_secs(config.window_secs),
        }
    }
}

#[derive(Debug)]
struct HealthRecord {
    status: HealthStatus,
    last_success: Option<DateTime<Utc>>,
    /// Timestamps of the current run of consecutive failures
    failures: VecDeque<Instant>,
    last_probe: Option<Instant>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_success: None,
            failures: VecDeque::new(),
            last_probe: None,
        }
    }

    fn snapshot(&self) -> BackendHealthState {
        BackendHealthState {
            status: self.status,
            last_success: self.last_success,
            consecutive_failures: self.failures.len() as u32,
        }
    }
}

/// Backend health counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct HealthSummary {
    pub total: usize,
    pub unknown: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unavailable: usize,
}

/// Owns the health state of every backend
pub struct HealthTracker {
    records: DashMap<String, Arc<Mutex<HealthRecord>>>,
    policy: RwLock<HealthPolicy>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy: RwLock::new(policy),
        }
    }

    pub fn set_policy(&self, policy: HealthPolicy) {
        *self.policy.write() = policy;
    }

    fn record(&self, name: &str) -> Arc<Mutex<HealthRecord>> {
        if let Some(record) = self.records.get(name) {
            return record.value().clone();
        }
        self.records
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HealthRecord::new())))
            .value()
            .clone()
    }

    /// Track exactly these backends: new ones start Unknown, removed ones are forgotten
    pub fn sync_backends(&self, names: &[String]) {
        self.records.retain(|name, _| names.contains(name));
        for name in names {
            self.record(name);
        }
    }

    pub fn status(&self, name: &str) -> HealthStatus {
        self.records
            .get(name)
            .map(|r| r.lock().status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn state(&self, name: &str) -> Option<BackendHealthState> {
        self.records.get(name).map(|r| r.lock().snapshot())
    }

    /// A request or probe succeeded
    pub fn record_success(&self, name: &str) {
        let record = self.record(name);
        let mut record = record.lock();
        let previous = record.status;

        record.status = HealthStatus::Healthy;
        record.last_success = Some(Utc::now());
        record.failures.clear();

        if previous != HealthStatus::Healthy {
            info!(backend = %name, from = %previous, "Backend is healthy");
        }
    }

    /// A request or probe failed
    pub fn record_failure(&self, name: &str, severity: FailureSeverity) {
        if severity == FailureSeverity::None {
            return;
        }

        let policy = *self.policy.read();
        let record = self.record(name);
        let mut record = record.lock();
        let now = Instant::now();

        record
            .failures
            .retain(|at| now.saturating_duration_since(*at) <= policy.window);
        record.failures.push_back(now);
        let consecutive = record.failures.len() as u32;

        let computed = if severity == FailureSeverity::Fatal || consecutive >= policy.unavailable_after
        {
            HealthStatus::Unavailable
        } else if consecutive >= policy.degraded_after {
            HealthStatus::Degraded
        } else {
            record.status
        };

        // Only a success moves a backend back up
        let previous = record.status;
        let next = match (previous, computed) {
            (HealthStatus::Unavailable, _) => HealthStatus::Unavailable,
            (HealthStatus::Degraded, HealthStatus::Unavailable) => HealthStatus::Unavailable,
            (HealthStatus::Degraded, _) => HealthStatus::Degraded,
            (_, computed) => computed,
        };
        record.status = next;

        if next != previous {
            warn!(
                backend = %name,
                from = %previous,
                to = %next,
                consecutive_failures = consecutive,
                fatal = severity == FailureSeverity::Fatal,
                "Backend health degraded"
            );
        } else {
            debug!(backend = %name, consecutive_failures = consecutive, "Recorded backend failure");
        }
    }

    /// Whether the prober should check this backend now
    fn should_probe(&self, name: &str, unavailable_interval: Duration) -> bool {
        let record = self.record(name);
        let mut record = record.lock();
        let now = Instant::now();

        let due = record.status != HealthStatus::Unavailable
            || record
                .last_probe
                .map_or(true, |at| now.saturating_duration_since(at) >= unavailable_interval);
        if due {
            record.last_probe = Some(now);
        }
        due
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for entry in self.records.iter() {
            summary.total += 1;
            match entry.value().lock().status {
                HealthStatus::Unknown => summary.unknown += 1,
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unavailable => summary.unavailable += 1,
            }
        }
        summary
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

/// Periodically probes every registered backend
pub struct HealthCheckManager {
    registry: Arc<BackendRegistry>,
    tracker: Arc<HealthTracker>,
    config: RwLock<HealthConfig>,
    cancel_token: CancellationToken,
}

impl HealthCheckManager {
    pub fn new(registry: Arc<BackendRegistry>, tracker: Arc<HealthTracker>, config: HealthConfig) -> Self {
        Self {
            registry,
            tracker,
            config: RwLock::new(config),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn set_config(&self, config: HealthConfig) {
        *self.config.write() = config;
    }

    /// Probe all due backends once
    pub async fn probe_all(&self) {
        let (unavailable_interval, probe_timeout) = {
            let config = self.config.read();
            (
                Duration::from_secs(config.unavailable_probe_interval_secs),
                Duration::from_secs(config.probe_timeout_secs),
            )
        };

        let snapshot = self.registry.snapshot();
        let probes = snapshot
            .iter()
            .filter(|backend| {
                self.tracker
                    .should_probe(&backend.descriptor.name, unavailable_interval)
            })
            .map(|backend| {
                let name = backend.descriptor.name.clone();
                let client = backend.client.clone();
                async move {
                    let outcome = tokio::time::timeout(probe_timeout, client.probe())
                        .await
                        .unwrap_or_else(|_| ProbeOutcome::Unhealthy("probe timed out".to_string()));
                    (name, outcome)
                }
            });

        for (name, outcome) in futures::future::join_all(probes).await {
            match outcome {
                ProbeOutcome::Healthy => self.tracker.record_success(&name),
                ProbeOutcome::Unhealthy(reason) => {
                    debug!(backend = %name, reason = %reason, "Health probe failed");
                    self.tracker.record_failure(&name, FailureSeverity::Transient);
                }
                ProbeOutcome::Unreachable(reason) => {
                    debug!(backend = %name, reason = %reason, "Backend unreachable");
                    self.tracker.record_failure(&name, FailureSeverity::Fatal);
                }
            }
        }
    }

    /// Start the background probe loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        let cancel_token = self.cancel_token.clone();
        let period = Duration::from_secs(self.config.read().probe_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "Starting health checks");

            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.probe_all().await,
                    _ = cancel_token.cancelled() => {
                        debug!("Health checks stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn summary(&self) -> HealthSummary {
        self.tracker.summary()
    }
}
