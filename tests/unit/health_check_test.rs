//! Unit tests for health tracking

use llm_stream_gateway::backend::{BackendRegistry, FailureSeverity, RegistrySnapshot, TextBackend};
use llm_stream_gateway::gateway::{HealthCheckManager, HealthPolicy, HealthStatus, HealthTracker};
use llm_stream_gateway::config::HealthConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{descriptor, ScriptedBackend, Tail};

fn policy(degraded_after: u32, unavailable_after: u32) -> HealthPolicy {
    HealthPolicy {
        degraded_after,
        unavailable_after,
        window: Duration::from_secs(60),
    }
}

#[test]
fn test_full_state_machine() {
    let tracker = HealthTracker::new(policy(3, 5));

    assert_eq!(tracker.status("primary"), HealthStatus::Unknown);
    tracker.record_success("primary");
    assert_eq!(tracker.status("primary"), HealthStatus::Healthy);

    for _ in 0..3 {
        tracker.record_failure("primary", FailureSeverity::Transient);
    }
    assert_eq!(tracker.status("primary"), HealthStatus::Degraded);

    tracker.record_failure("primary", FailureSeverity::Transient);
    assert_eq!(tracker.status("primary"), HealthStatus::Degraded);
    tracker.record_failure("primary", FailureSeverity::Transient);
    assert_eq!(tracker.status("primary"), HealthStatus::Unavailable);

    let state = tracker.state("primary").unwrap();
    assert_eq!(state.consecutive_failures, 5);
    assert!(state.last_success.is_some());

    tracker.record_success("primary");
    assert_eq!(tracker.status("primary"), HealthStatus::Healthy);
}

#[test]
fn test_backends_are_isolated() {
    let tracker = HealthTracker::new(policy(1, 2));
    tracker.record_success("a");
    tracker.record_success("b");
    tracker.record_failure("a", FailureSeverity::Fatal);

    assert_eq!(tracker.status("a"), HealthStatus::Unavailable);
    assert_eq!(tracker.status("b"), HealthStatus::Healthy);

    let summary = tracker.summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.healthy, 1);
    assert_eq!(summary.unavailable, 1);
}

#[test]
fn test_policy_update_applies_to_next_failure() {
    let tracker = HealthTracker::new(policy(3, 5));
    tracker.record_success("primary");
    tracker.record_failure("primary", FailureSeverity::Transient);

    tracker.set_policy(policy(2, 3));
    tracker.record_failure("primary", FailureSeverity::Transient);
    assert_eq!(tracker.status("primary"), HealthStatus::Degraded);
}

#[test]
fn test_policy_from_config_clamps_unavailable_threshold() {
    let config = HealthConfig {
        degraded_after: 4,
        unavailable_after: 2,
        ..Default::default()
    };
    let policy = HealthPolicy::from(&config);
    assert_eq!(policy.unavailable_after, 4);
}

#[tokio::test]
async fn test_probe_recovers_unavailable_backend() {
    let backend = ScriptedBackend::new("primary", Vec::new(), Tail::End);
    let mut snapshot = RegistrySnapshot::new(None);
    snapshot
        .insert(descriptor("primary", 4, 0, 100), backend as Arc<dyn TextBackend>)
        .unwrap();
    let registry = Arc::new(BackendRegistry::with_snapshot(snapshot));
    let tracker = Arc::new(HealthTracker::default());
    tracker.record_failure("primary", FailureSeverity::Fatal);

    let config = HealthConfig {
        unavailable_probe_interval_secs: 0,
        ..Default::default()
    };
    let manager = HealthCheckManager::new(registry, tracker.clone(), config);
    manager.probe_all().await;

    assert_eq!(tracker.status("primary"), HealthStatus::Healthy);
}

#[tokio::test]
async fn test_background_prober_stops_on_cancel() {
    let registry = Arc::new(BackendRegistry::new());
    let tracker = Arc::new(HealthTracker::default());
    let manager = Arc::new(HealthCheckManager::new(
        registry,
        tracker,
        HealthConfig::default(),
    ));

    let handle = manager.start();
    manager.stop();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("prober did not stop")
        .unwrap();
}
