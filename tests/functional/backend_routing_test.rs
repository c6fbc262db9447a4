//! Backend selection and health feedback across requests

use axum::http::StatusCode;
use llm_stream_gateway::api::create_router;
use llm_stream_gateway::backend::{FailureSeverity, StreamError, StreamEvent, TextBackend};
use llm_stream_gateway::error::ErrorKind;
use llm_stream_gateway::gateway::HealthStatus;
use std::sync::Arc;
use tower::ServiceExt;

use crate::common::{
    app_state, chat_body, chat_request, deltas, descriptor, done, wait_until, ScriptedBackend, Tail,
};

fn ok_script() -> Vec<StreamEvent> {
    let mut events = deltas(&["ok"]);
    events.push(done());
    events
}

fn failing_script() -> Vec<StreamEvent> {
    vec![StreamEvent::Error(StreamError::new(
        ErrorKind::UpstreamError,
        "CUDA out of memory at 0x7f3a",
        FailureSeverity::Transient,
    ))]
}

#[tokio::test]
async fn test_requests_without_alias_stick_to_default() {
    let primary = ScriptedBackend::new("primary", ok_script(), Tail::End);
    let secondary = ScriptedBackend::new("secondary", ok_script(), Tail::End);
    let state = app_state(
        vec![
            (descriptor("primary", 4, 0, 100), primary.clone() as Arc<dyn TextBackend>),
            (descriptor("secondary", 4, 0, 100), secondary.clone() as Arc<dyn TextBackend>),
        ],
        Some("primary"),
    );

    for _ in 0..3 {
        let response = create_router(state.clone())
            .oneshot(chat_request(chat_body(None, false)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(primary.opened(), 3);
    assert_eq!(secondary.opened(), 0);
}

#[tokio::test]
async fn test_alias_routes_to_its_backend() {
    let primary = ScriptedBackend::new("primary", ok_script(), Tail::End);
    let secondary = ScriptedBackend::new("secondary", ok_script(), Tail::End);
    let state = app_state(
        vec![
            (descriptor("primary", 4, 0, 100), primary.clone() as Arc<dyn TextBackend>),
            (descriptor("secondary", 4, 0, 100), secondary.clone() as Arc<dyn TextBackend>),
        ],
        Some("primary"),
    );

    let response = create_router(state)
        .oneshot(chat_request(chat_body(Some("secondary-model"), false)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(primary.opened(), 0);
    assert_eq!(secondary.opened(), 1);
}

#[tokio::test]
async fn test_unavailable_backend_fails_fast_without_substitution() {
    let primary = ScriptedBackend::new("primary", ok_script(), Tail::End);
    let secondary = ScriptedBackend::new("secondary", ok_script(), Tail::End);
    let state = app_state(
        vec![
            (descriptor("primary", 4, 0, 100), primary.clone() as Arc<dyn TextBackend>),
            (descriptor("secondary", 4, 0, 100), secondary.clone() as Arc<dyn TextBackend>),
        ],
        Some("primary"),
    );
    state.health.record_failure("primary", FailureSeverity::Fatal);
    assert_eq!(state.health.status("primary"), HealthStatus::Unavailable);

    let response = create_router(state.clone())
        .oneshot(chat_request(chat_body(Some("primary-model"), true)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(primary.opened(), 0);
    assert_eq!(secondary.opened(), 0);
    assert_eq!(state.admission.stats("primary").unwrap().admitted_total, 0);
}

#[tokio::test]
async fn test_failures_degrade_and_success_recovers() {
    let backend = ScriptedBackend::new("primary", failing_script(), Tail::End);
    let state = app_state(
        vec![(descriptor("primary", 4, 0, 100), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );
    let router = create_router(state.clone());

    for attempt in 1..=3u32 {
        let response = router
            .clone()
            .oneshot(chat_request(chat_body(None, true)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["kind"], "upstream_error");
        // Backend internals are not leaked to clients
        assert!(!json["error"]["message"].as_str().unwrap().contains("CUDA"));

        let health = state.health.clone();
        assert!(
            wait_until(|| {
                health
                    .state("primary")
                    .map_or(false, |s| s.consecutive_failures == attempt)
            })
            .await
        );
    }
    assert_eq!(state.health.status("primary"), HealthStatus::Degraded);

    // Degraded backends still serve traffic
    backend.set_script(ok_script(), Tail::End);
    let response = router
        .clone()
        .oneshot(chat_request(chat_body(None, false)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health = state.health.clone();
    assert!(wait_until(|| health.status("primary") == HealthStatus::Healthy).await);
    assert_eq!(state.health.state("primary").unwrap().consecutive_failures, 0);
    assert_eq!(state.admission.in_flight("primary"), 0);
}

#[tokio::test]
async fn test_validation_errors_do_not_touch_health() {
    let backend = ScriptedBackend::new("primary", ok_script(), Tail::End);
    let state = app_state(
        vec![(descriptor("primary", 4, 0, 100), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );

    for _ in 0..5 {
        let response = create_router(state.clone())
            .oneshot(chat_request(r#"{"messages": []}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    assert_eq!(backend.opened(), 0);
    assert_eq!(state.health.status("primary"), HealthStatus::Unknown);
}
