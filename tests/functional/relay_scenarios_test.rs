//! Streaming relay scenarios: saturation, upstream loss, client disconnect
//! and backpressure

use axum::http::StatusCode;
use futures::StreamExt;
use llm_stream_gateway::api::create_router;
use llm_stream_gateway::backend::TextBackend;
use llm_stream_gateway::config::Settings;
use llm_stream_gateway::gateway::HealthStatus;
use llm_stream_gateway::AppState;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use crate::common::{
    app_state, app_state_with, backend_config, chat_body, chat_request, deltas, descriptor, done,
    spawn_dropping_upstream, wait_until, ScriptedBackend, Tail,
};

fn data_frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| {
            frame
                .lines()
                .find_map(|line| line.strip_prefix("data:"))
                .map(|data| data.trim().to_string())
        })
        .collect()
}

fn has_error_event(body: &str) -> bool {
    body.lines()
        .any(|line| line.strip_prefix("event:").map(str::trim) == Some("error"))
}

#[tokio::test]
async fn test_saturated_backend_rejects_then_recovers() {
    let backend = ScriptedBackend::new("primary", deltas(&["hold"]), Tail::Hang);
    let state = app_state(
        vec![(descriptor("primary", 1, 0, 50), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );

    let held = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(held.status(), StatusCode::OK);
    assert_eq!(state.admission.in_flight("primary"), 1);

    let rejected = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(backend.opened(), 1);
    assert_eq!(state.admission.stats("primary").unwrap().rejected_total, 1);

    drop(held);
    let admission = state.admission.clone();
    assert!(wait_until(|| admission.in_flight("primary") == 0).await);

    let admitted = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(admitted.status(), StatusCode::OK);
    assert_eq!(backend.opened(), 2);
}

#[tokio::test]
async fn test_upstream_drop_mid_stream_ends_with_error_frame() {
    let addr = spawn_dropping_upstream(vec!["one", "two", "three"]).await;

    let mut settings = Settings::default();
    settings.backends = vec![backend_config("primary", &format!("http://{}", addr))];
    settings.routing.default_backend = Some("primary".to_string());
    let state = Arc::new(AppState::new(settings, None).unwrap());

    let response = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let frames = data_frames(&body);

    assert_eq!(frames.len(), 4);
    let contents: Vec<String> = frames[..3]
        .iter()
        .map(|f| {
            let chunk: serde_json::Value = serde_json::from_str(f).unwrap();
            chunk["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    assert!(has_error_event(&body));
    let error: serde_json::Value = serde_json::from_str(&frames[3]).unwrap();
    assert_eq!(error["error"]["kind"], "upstream_disconnected");
    assert!(!body.contains("[DONE]"));

    let admission = state.admission.clone();
    assert!(wait_until(|| admission.in_flight("primary") == 0).await);
    assert_eq!(state.admission.stats("primary").unwrap().released_total, 1);

    let health = state.health.clone();
    assert!(
        wait_until(|| health
            .state("primary")
            .map_or(false, |s| s.consecutive_failures == 1))
        .await
    );
}

#[tokio::test]
async fn test_client_disconnect_cancels_upstream() {
    let backend = ScriptedBackend::new("primary", deltas(&["first", "second"]), Tail::Hang);
    let state = app_state(
        vec![(descriptor("primary", 2, 0, 100), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );

    let response = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("first"));
    drop(body);

    let upstream = backend.clone();
    assert!(wait_until(|| upstream.dropped() == 1).await);
    let admission = state.admission.clone();
    assert!(wait_until(|| admission.in_flight("primary") == 0).await);

    let stats = state.admission.stats("primary").unwrap();
    assert_eq!(stats.admitted_total, 1);
    assert_eq!(stats.released_total, 1);

    // Client cancellation says nothing about the backend
    assert_eq!(state.health.status("primary"), HealthStatus::Unknown);
}

#[tokio::test]
async fn test_no_slot_leaks_across_early_disconnects() {
    let backend = ScriptedBackend::new("primary", Vec::new(), Tail::Endless);
    let state = app_state(
        vec![(descriptor("primary", 2, 0, 100), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );
    let router = create_router(state.clone());
    let iterations = 30;

    for i in 0..iterations {
        let response = router
            .clone()
            .oneshot(chat_request(chat_body(None, true)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        for _ in 0..(i % 5) {
            body.next().await.unwrap().unwrap();
        }
        drop(body);

        let admission = state.admission.clone();
        assert!(wait_until(|| admission.in_flight("primary") == 0).await);
    }

    let stats = state.admission.stats("primary").unwrap();
    assert_eq!(stats.admitted_total, iterations);
    assert_eq!(stats.released_total, iterations);
    assert_eq!(stats.rejected_total, 0);

    let upstream = backend.clone();
    assert!(wait_until(|| upstream.dropped() == iterations as usize).await);
}

#[tokio::test]
async fn test_slow_client_bounds_upstream_read_ahead() {
    let mut settings = Settings::default();
    settings.relay.read_ahead = 4;
    let backend = ScriptedBackend::new("primary", Vec::new(), Tail::Endless);
    let state = app_state_with(
        settings,
        vec![(descriptor("primary", 1, 0, 100), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );

    let response = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let pulled = backend.yielded();
    // primed first event + full channel + one event waiting to be sent
    assert!(pulled <= 4 + 2, "pulled {} events from upstream", pulled);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.yielded(), pulled);

    drop(response);
    let upstream = backend.clone();
    assert!(wait_until(|| upstream.dropped() == 1).await);
}

#[tokio::test]
async fn test_long_stream_preserves_order() {
    let texts: Vec<String> = (0..100).map(|i| format!("d{} ", i)).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let mut events = deltas(&refs);
    events.push(done());
    let backend = ScriptedBackend::new("primary", events, Tail::End);
    let state = app_state(
        vec![(descriptor("primary", 1, 0, 100), backend as Arc<dyn TextBackend>)],
        Some("primary"),
    );

    let response = create_router(state)
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let frames = data_frames(&String::from_utf8(bytes.to_vec()).unwrap());

    // 100 deltas, the finishing chunk and [DONE]
    assert_eq!(frames.len(), 102);
    let streamed: Vec<String> = frames[..100]
        .iter()
        .map(|f| {
            let chunk: serde_json::Value = serde_json::from_str(f).unwrap();
            chunk["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(streamed, texts);
    assert_eq!(frames[101], "[DONE]");
}

#[tokio::test]
async fn test_stream_deadline_ends_with_timeout_frame() {
    let mut settings = Settings::default();
    settings.relay.read_ahead = 2;
    settings.relay.request_timeout_ms = 100;
    let backend = ScriptedBackend::new("primary", Vec::new(), Tail::Endless);
    let state = app_state_with(
        settings,
        vec![(descriptor("primary", 1, 0, 100), backend.clone() as Arc<dyn TextBackend>)],
        Some("primary"),
    );

    let response = create_router(state.clone())
        .oneshot(chat_request(chat_body(None, true)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The client reads nothing until well past the deadline
    tokio::time::sleep(Duration::from_millis(250)).await;

    let upstream = backend.clone();
    assert!(wait_until(|| upstream.dropped() == 1).await);
    let admission = state.admission.clone();
    assert!(wait_until(|| admission.in_flight("primary") == 0).await);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    let frames = data_frames(&body);

    assert!(has_error_event(&body));
    assert!(!body.contains("[DONE]"));
    let (last, deltas) = frames.split_last().unwrap();
    let error: serde_json::Value = serde_json::from_str(last).unwrap();
    assert_eq!(error["error"]["kind"], "upstream_timeout");

    // Every delta pulled from the backend reached the client, in order
    let streamed: Vec<String> = deltas
        .iter()
        .map(|f| {
            let chunk: serde_json::Value = serde_json::from_str(f).unwrap();
            chunk["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
        })
        .collect();
    let expected: Vec<String> = (1..=streamed.len()).map(|i| format!("t{} ", i)).collect();
    assert_eq!(streamed, expected);
    assert_eq!(streamed.len(), backend.yielded());

    let stats = state.admission.stats("primary").unwrap();
    assert_eq!(stats.released_total, 1);
    let health = state.health.state("primary").unwrap();
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(state.health.status("primary"), HealthStatus::Unknown);
}
