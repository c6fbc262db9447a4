//! Admission control
//!
//! Every backend has a fixed number of upstream slots and a bounded FIFO
//! queue in front of them. A gateway-wide limit caps the sum across backends.
//! Counters are per backend; admitting to one backend never locks another.
//!
//! A reload resizes a gate in place. Growing adds permits at once; shrinking
//! retires free permits at once and the rest as in-flight slots come back,
//! so the backend never sees more than the old limit during the change.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::backend::BackendDescriptor;
use crate::error::{AppError, Result};

/// Why a slot was given back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Completed,
    BackendError,
    Cancelled,
    TimedOut,
    /// Released by `Drop` without an explicit outcome
    Dropped,
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            ReleaseReason::Completed => "completed",
            ReleaseReason::BackendError => "backend_error",
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::TimedOut => "timed_out",
            ReleaseReason::Dropped => "dropped",
        };
        f.write_str(reason)
    }
}

/// Admission counters for one backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct AdmissionStats {
    pub limit: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub queue_depth: usize,
    pub admitted_total: u64,
    pub released_total: u64,
    pub rejected_total: u64,
}

#[derive(Debug)]
struct BackendGate {
    limit: AtomicUsize,
    permits: Arc<Semaphore>,
    /// Permits to drop instead of returning, owed after a limit decrease
    retiring: AtomicUsize,
    resize: Mutex<()>,
    queue_depth: AtomicUsize,
    queue_timeout_ms: AtomicU64,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    admitted_total: AtomicU64,
    released_total: AtomicU64,
    rejected_total: AtomicU64,
}

impl BackendGate {
    fn new(descriptor: &BackendDescriptor) -> Self {
        Self {
            limit: AtomicUsize::new(descriptor.max_concurrency),
            permits: Arc::new(Semaphore::new(descriptor.max_concurrency)),
            retiring: AtomicUsize::new(0),
            resize: Mutex::new(()),
            queue_depth: AtomicUsize::new(descriptor.queue_depth),
            queue_timeout_ms: AtomicU64::new(descriptor.queue_timeout.as_millis() as u64),
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            admitted_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
        }
    }

    fn update(&self, descriptor: &BackendDescriptor) {
        self.queue_depth
            .store(descriptor.queue_depth, Ordering::Relaxed);
        self.queue_timeout_ms
            .store(descriptor.queue_timeout.as_millis() as u64, Ordering::Relaxed);
        self.resize_to(descriptor.max_concurrency);
    }

    fn resize_to(&self, limit: usize) {
        let _serialized = self.resize.lock();
        let current = self.limit.load(Ordering::Acquire);

        if limit > current {
            let grow = limit - current;
            // Cancel outstanding retirements before minting new permits
            let owed = self
                .retiring
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| {
                    Some(owed - owed.min(grow))
                })
                .unwrap_or_default();
            self.permits.add_permits(grow - owed.min(grow));
        } else if limit < current {
            let mut shrink = current - limit;
            while shrink > 0 {
                match self.permits.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            self.retiring.fetch_add(shrink, Ordering::AcqRel);
        }

        self.limit.store(limit, Ordering::Release);
    }

    /// Return a backend permit, or retire it if the limit was lowered
    fn give_back(&self, permit: OwnedSemaphorePermit) {
        let retire = self
            .retiring
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| owed.checked_sub(1))
            .is_ok();
        if retire {
            permit.forget();
        }
    }

    /// Claim a place in the wait queue, or `None` when it is full
    fn enter_queue(self: &Arc<Self>) -> Option<QueueTicket> {
        let depth = self.queue_depth.load(Ordering::Relaxed);
        self.waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < depth).then_some(waiting + 1)
            })
            .ok()
            .map(|_| QueueTicket { gate: self.clone() })
    }

    fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            limit: self.limit.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            waiting: self.waiting.load(Ordering::Acquire),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            admitted_total: self.admitted_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
        }
    }
}

/// A place in a backend's wait queue; leaving it (admitted, timed out or
/// cancelled) frees the place.
struct QueueTicket {
    gate: Arc<BackendGate>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.gate.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One reserved upstream slot. Released exactly once: explicitly through
/// [`AdmissionSlot::release`] or, failing that, on drop.
#[derive(Debug)]
pub struct AdmissionSlot {
    backend: String,
    gate: Arc<BackendGate>,
    permits: Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)>,
}

impl AdmissionSlot {
    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn is_released(&self) -> bool {
        self.permits.is_none()
    }

    /// Give the slot back. Returns `false` if it was already released.
    pub fn release(&mut self, reason: ReleaseReason) -> bool {
        let Some((backend_permit, global_permit)) = self.permits.take() else {
            return false;
        };
        self.gate.give_back(backend_permit);
        drop(global_permit);

        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.gate.released_total.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %self.backend, reason = %reason, "Released admission slot");
        true
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release(ReleaseReason::Dropped);
    }
}

/// Bounds concurrent upstream requests per backend and gateway-wide
pub struct AdmissionController {
    gates: DashMap<String, Arc<BackendGate>>,
    global: Arc<Semaphore>,
    global_limit: usize,
}

impl AdmissionController {
    pub fn new(global_limit: usize) -> Self {
        Self {
            gates: DashMap::new(),
            global: Arc::new(Semaphore::new(global_limit)),
            global_limit,
        }
    }

    pub fn global_limit(&self) -> usize {
        self.global_limit
    }

    /// Align gates with a new backend table. Existing gates keep their
    /// counters and in-flight slots and are resized in place.
    pub fn sync<'a>(&self, descriptors: impl IntoIterator<Item = &'a BackendDescriptor>) {
        let mut seen = Vec::new();
        for descriptor in descriptors {
            seen.push(descriptor.name.clone());
            let existing = self.gates.get(&descriptor.name).map(|gate| gate.value().clone());
            match existing {
                Some(gate) => {
                    let previous = gate.limit.load(Ordering::Acquire);
                    gate.update(descriptor);
                    if previous != descriptor.max_concurrency {
                        info!(
                            backend = %descriptor.name,
                            from = previous,
                            to = descriptor.max_concurrency,
                            in_flight = gate.in_flight.load(Ordering::Acquire),
                            "Resized admission gate"
                        );
                    }
                }
                None => {
                    info!(
                        backend = %descriptor.name,
                        max_concurrency = descriptor.max_concurrency,
                        queue_depth = descriptor.queue_depth,
                        "Configured admission gate"
                    );
                    self.gates
                        .insert(descriptor.name.clone(), Arc::new(BackendGate::new(descriptor)));
                }
            }
        }
        self.gates.retain(|name, _| seen.contains(name));
    }

    fn gate(&self, descriptor: &BackendDescriptor) -> Arc<BackendGate> {
        if let Some(gate) = self.gates.get(&descriptor.name) {
            return gate.clone();
        }
        self.gates
            .entry(descriptor.name.clone())
            .or_insert_with(|| Arc::new(BackendGate::new(descriptor)))
            .clone()
    }

    /// Reserve a slot on `descriptor`'s backend, waiting in its queue for at
    /// most the configured queue timeout. Dropping the returned future while
    /// waiting leaves the queue cleanly.
    pub async fn try_admit(&self, descriptor: &BackendDescriptor) -> Result<AdmissionSlot> {
        let gate = self.gate(descriptor);
        let name = &descriptor.name;

        let backend_permit = match gate.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let Some(_ticket) = gate.enter_queue() else {
                    return Err(self.reject(&gate, name, "concurrency limit reached and queue is full"));
                };

                let wait = Duration::from_millis(gate.queue_timeout_ms.load(Ordering::Relaxed));
                debug!(backend = %name, wait_ms = wait.as_millis() as u64, "Queued for admission");
                match tokio::time::timeout(wait, gate.permits.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(AppError::Internal(format!(
                            "admission gate for '{}' is closed",
                            name
                        )))
                    }
                    Err(_) => {
                        return Err(self.reject(&gate, name, "timed out waiting for a free slot"))
                    }
                }
            }
        };

        let global_permit = match self.global.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Err(self.reject(&gate, name, "gateway-wide concurrency limit reached")),
        };

        gate.in_flight.fetch_add(1, Ordering::AcqRel);
        gate.admitted_total.fetch_add(1, Ordering::Relaxed);

        Ok(AdmissionSlot {
            backend: name.clone(),
            gate,
            permits: Some((backend_permit, global_permit)),
        })
    }

    fn reject(&self, gate: &BackendGate, backend: &str, reason: &str) -> AppError {
        gate.rejected_total.fetch_add(1, Ordering::Relaxed);
        warn!(backend = %backend, reason = %reason, "Admission rejected");
        AppError::BackendSaturated(format!("backend '{}': {}", backend, reason))
    }

    pub fn stats(&self, backend: &str) -> Option<AdmissionStats> {
        self.gates.get(backend).map(|gate| gate.stats())
    }

    pub fn in_flight(&self, backend: &str) -> usize {
        self.stats(backend).map_or(0, |s| s.in_flight)
    }

    /// Requests in flight across all backends
    pub fn total_in_flight(&self) -> usize {
        self.global_limit - self.global.available_permits()
    }
}
