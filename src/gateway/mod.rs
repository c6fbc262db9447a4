//! Gateway module - health tracking, backend selection, and hot reload

pub mod health_check;
pub mod reload;
pub mod router;

pub use health_check::{
    BackendHealthState, HealthCheckManager, HealthPolicy, HealthStatus, HealthSummary,
    HealthTracker,
};
pub use router::BackendSelector;
