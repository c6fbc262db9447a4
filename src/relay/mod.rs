//! Streaming relay
//!
//! Each admitted request gets one relay task that pulls events from the
//! backend stream and pushes them into a bounded channel read by the client
//! connection. The channel capacity is the read-ahead: a slow client stalls
//! the task, which stops polling the backend.
//!
//! Cancellation flows one way. Dropping the [`RelayStream`] (client gone)
//! cancels the task, the task drops the backend stream (aborting the upstream
//! HTTP call), and the admission slot is released.
//!
//! A deadline can fire while the channel is full. Whatever the task still
//! holds, plus the timeout error, goes through a separate oneshot that the
//! [`RelayStream`] yields once the channel is drained, so a stalled client
//! still sees the terminal event.

use futures::StreamExt;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    EventStream, FailureSeverity, GenerationRequest, RegisteredBackend, StreamError, StreamEvent,
};
use crate::config::RelayConfig;
use crate::error::ErrorKind;
use crate::gateway::health_check::HealthTracker;
use crate::queue::{AdmissionSlot, ReleaseReason};

const SANITIZED_UPSTREAM_MESSAGE: &str = "the backend failed to complete the request";

/// Lifecycle of an in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    /// Slot held, waiting for the first backend event
    Admitted,
    /// At least one event forwarded
    Streaming,
    /// Slot released
    Terminal,
}

/// How a relay ended
#[derive(Debug, Clone, PartialEq)]
enum RelayOutcome {
    Completed,
    BackendError(StreamError),
    Cancelled,
    TimedOut,
}

impl RelayOutcome {
    fn release_reason(&self) -> ReleaseReason {
        match self {
            RelayOutcome::Completed => ReleaseReason::Completed,
            RelayOutcome::BackendError(_) => ReleaseReason::BackendError,
            RelayOutcome::Cancelled => ReleaseReason::Cancelled,
            RelayOutcome::TimedOut => ReleaseReason::TimedOut,
        }
    }
}

/// One admitted request and the slot it holds
#[derive(Debug)]
pub struct InFlightRequest {
    pub id: Uuid,
    pub backend: String,
    slot: AdmissionSlot,
    cancel: CancellationToken,
    phase: RelayPhase,
}

impl InFlightRequest {
    fn new(backend: String, slot: AdmissionSlot) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            slot,
            cancel: CancellationToken::new(),
            phase: RelayPhase::Admitted,
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    fn streaming(&mut self) {
        if self.phase == RelayPhase::Admitted {
            debug!(request_id = %self.id, "First event from backend");
            self.phase = RelayPhase::Streaming;
        }
    }

    /// Move to Terminal and give the slot back. Only the first call has any effect.
    fn finish(&mut self, reason: ReleaseReason) -> bool {
        if self.phase == RelayPhase::Terminal {
            return false;
        }
        self.phase = RelayPhase::Terminal;
        self.slot.release(reason)
    }
}

/// Client side of a relay. Dropping it cancels the upstream request.
pub struct RelayStream {
    id: Uuid,
    backend: String,
    events: ReceiverStream<StreamEvent>,
    tail: Option<oneshot::Receiver<Vec<StreamEvent>>>,
    pending_tail: std::vec::IntoIter<StreamEvent>,
    _cancel_on_drop: DropGuard,
}

impl RelayStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl futures::Stream for RelayStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending_tail.next() {
            return Poll::Ready(Some(event));
        }

        match Pin::new(&mut this.events).poll_next(cx) {
            Poll::Ready(Some(event)) => return Poll::Ready(Some(event)),
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => {}
        }

        // Channel drained and closed; the tail comes last
        if let Some(tail) = this.tail.as_mut() {
            match Pin::new(tail).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(events) => {
                    this.tail = None;
                    this.pending_tail = events.unwrap_or_default().into_iter();
                }
            }
        }

        Poll::Ready(this.pending_tail.next())
    }
}

/// Starts relay tasks and feeds their outcomes to the Health Tracker
pub struct StreamRelay {
    health: Arc<HealthTracker>,
    config: RwLock<RelayConfig>,
}

impl StreamRelay {
    pub fn new(health: Arc<HealthTracker>, config: RelayConfig) -> Self {
        Self {
            health,
            config: RwLock::new(config),
        }
    }

    pub fn set_config(&self, config: RelayConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> RelayConfig {
        self.config.read().clone()
    }

    /// Open the backend stream and start relaying it. The slot is owned by the
    /// relay from here on.
    pub fn start(
        &self,
        request: Arc<GenerationRequest>,
        backend: RegisteredBackend,
        slot: AdmissionSlot,
    ) -> RelayStream {
        let config = self.config();
        let flight = InFlightRequest::new(backend.descriptor.name.clone(), slot);
        let (tx, rx) = mpsc::channel(config.read_ahead.max(1));
        let (tail_tx, tail_rx) = oneshot::channel();

        let stream = RelayStream {
            id: flight.id,
            backend: flight.backend.clone(),
            events: ReceiverStream::new(rx),
            tail: Some(tail_rx),
            pending_tail: Vec::new().into_iter(),
            _cancel_on_drop: flight.cancel.clone().drop_guard(),
        };

        info!(
            request_id = %flight.id,
            backend = %flight.backend,
            stream = request.stream,
            "Relay started"
        );

        let upstream = backend.client.open_stream(request);
        tokio::spawn(run_relay(
            flight,
            upstream,
            RelaySink { events: tx, tail: tail_tx },
            self.health.clone(),
            config,
        ));

        stream
    }
}

fn sanitize(event: StreamEvent, config: &RelayConfig, request_id: Uuid) -> StreamEvent {
    match event {
        StreamEvent::Error(err) if config.sanitize_errors && err.kind == ErrorKind::UpstreamError => {
            warn!(request_id = %request_id, error = %err.message, "Backend error hidden from client");
            StreamEvent::Error(StreamError::new(err.kind, SANITIZED_UPSTREAM_MESSAGE, err.severity))
        }
        other => other,
    }
}

/// Task side of a [`RelayStream`]
struct RelaySink {
    events: mpsc::Sender<StreamEvent>,
    tail: oneshot::Sender<Vec<StreamEvent>>,
}

async fn run_relay(
    mut flight: InFlightRequest,
    mut upstream: EventStream,
    sink: RelaySink,
    health: Arc<HealthTracker>,
    config: RelayConfig,
) {
    let RelaySink { events: tx, tail: tail_tx } = sink;
    let mut tail = Vec::new();
    let started = Instant::now();
    let overall_deadline = started + config.request_timeout();
    let first_event_deadline = (started + config.first_token_timeout()).min(overall_deadline);
    let cancel = flight.cancel.clone();
    let mut deltas: u64 = 0;

    let outcome = loop {
        let deadline = if flight.phase() == RelayPhase::Admitted {
            first_event_deadline
        } else {
            overall_deadline
        };

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayOutcome::Cancelled,
            _ = sleep_until(deadline) => break RelayOutcome::TimedOut,
            next = upstream.next() => next,
        };

        // A backend stream must end with Done or Error; treat a bare end as a drop
        let event = next.unwrap_or_else(|| {
            StreamEvent::Error(StreamError::disconnected(
                "backend stream ended without a completion",
            ))
        });
        flight.streaming();

        let terminal = match &event {
            StreamEvent::TokenDelta(_) => {
                deltas += 1;
                None
            }
            StreamEvent::Usage(_) => None,
            StreamEvent::Done { .. } => Some(RelayOutcome::Completed),
            StreamEvent::Error(err) => Some(RelayOutcome::BackendError(err.clone())),
        };
        let event = sanitize(event, &config, flight.id);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayOutcome::Cancelled,
            _ = sleep_until(overall_deadline) => {
                // The client is behind; keep the event for the tail
                tail.push(event);
                break terminal.unwrap_or(RelayOutcome::TimedOut);
            }
            permit = tx.reserve() => match permit {
                Ok(permit) => permit.send(event),
                Err(_) => break RelayOutcome::Cancelled,
            },
        }

        if let Some(outcome) = terminal {
            break outcome;
        }
    };

    // Abort the upstream call before giving the slot back
    drop(upstream);

    if outcome == RelayOutcome::TimedOut {
        let phase = if flight.phase() == RelayPhase::Admitted {
            "first token"
        } else {
            "completion"
        };
        tail.push(StreamEvent::Error(StreamError::timeout(format!(
            "backend '{}' made no progress before the {} deadline",
            flight.backend, phase
        ))));
    }
    drop(tx);
    // Fails only when the client is already gone
    let _ = tail_tx.send(tail);

    let released = flight.finish(outcome.release_reason());

    match &outcome {
        RelayOutcome::Completed => health.record_success(&flight.backend),
        RelayOutcome::BackendError(err) => health.record_failure(&flight.backend, err.severity),
        RelayOutcome::TimedOut => health.record_failure(&flight.backend, FailureSeverity::Transient),
        RelayOutcome::Cancelled => {}
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        RelayOutcome::BackendError(err) => warn!(
            request_id = %flight.id,
            backend = %flight.backend,
            kind = %err.kind,
            error = %err.message,
            deltas,
            elapsed_ms,
            released,
            "Relay ended with backend error"
        ),
        outcome => info!(
            request_id = %flight.id,
            backend = %flight.backend,
            outcome = %outcome.release_reason(),
            deltas,
            elapsed_ms,
            released,
            "Relay finished"
        ),
    }
}
