//! Shared helpers for the integration test targets
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{body::Body, routing::post, Router};
use bytes::Bytes;
use futures::{stream, StreamExt};
use llm_stream_gateway::{
    backend::{
        BackendDescriptor, Capabilities, EventStream, GenerationRequest, ProbeOutcome,
        RegistrySnapshot, StreamEvent, TextBackend,
    },
    config::{BackendConfig, ProtocolType, Settings},
    AppState,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted backend does after its events run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    End,
    Hang,
    /// Keep producing numbered deltas forever
    Endless,
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// In-process backend replaying a script and recording what happened to its streams
pub struct ScriptedBackend {
    name: String,
    script: Mutex<(Vec<StreamEvent>, Tail)>,
    delay: Option<Duration>,
    pub opened: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicUsize>,
    pub yielded: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(name: &str, events: Vec<StreamEvent>, tail: Tail) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new((events, tail)),
            delay: None,
            opened: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicUsize::new(0)),
            yielded: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_delay(name: &str, events: Vec<StreamEvent>, tail: Tail, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new((events, tail)),
            delay: Some(delay),
            opened: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicUsize::new(0)),
            yielded: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_script(&self, events: Vec<StreamEvent>, tail: Tail) {
        *self.script.lock() = (events, tail);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn yielded(&self) -> usize {
        self.yielded.load(Ordering::SeqCst)
    }
}

struct ScriptState {
    events: std::vec::IntoIter<StreamEvent>,
    tail: Tail,
    next_endless: usize,
    _dropped: DropCounter,
}

#[async_trait]
impl TextBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> &str {
        "scripted"
    }

    fn open_stream(&self, _request: Arc<GenerationRequest>) -> EventStream {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (events, tail) = self.script.lock().clone();
        let state = ScriptState {
            events: events.into_iter(),
            tail,
            next_endless: 0,
            _dropped: DropCounter(self.dropped.clone()),
        };
        let yielded = self.yielded.clone();
        let delay = self.delay;

        stream::unfold(state, move |mut state| {
            let yielded = yielded.clone();
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let event = match state.events.next() {
                    Some(event) => event,
                    None => match state.tail {
                        Tail::End => return None,
                        Tail::Hang => {
                            std::future::pending::<()>().await;
                            return None;
                        }
                        Tail::Endless => {
                            state.next_endless += 1;
                            StreamEvent::TokenDelta(format!("t{} ", state.next_endless))
                        }
                    },
                };
                yielded.fetch_add(1, Ordering::SeqCst);
                Some((event, state))
            }
        })
        .boxed()
    }

    async fn probe(&self) -> ProbeOutcome {
        ProbeOutcome::Healthy
    }

    async fn list_models(&self) -> llm_stream_gateway::Result<Vec<String>> {
        Ok(vec![self.name.clone()])
    }
}

pub fn deltas(texts: &[&str]) -> Vec<StreamEvent> {
    texts
        .iter()
        .map(|t| StreamEvent::TokenDelta(t.to_string()))
        .collect()
}

pub fn done() -> StreamEvent {
    StreamEvent::Done {
        finish_reason: "stop".to_string(),
    }
}

pub fn descriptor(name: &str, max_concurrency: usize, queue_depth: usize, queue_timeout_ms: u64) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_string(),
        endpoint: format!("http://{}.invalid:8000", name),
        protocol: ProtocolType::Vllm,
        capabilities: Capabilities {
            supports_streaming: true,
            max_context: None,
        },
        max_concurrency,
        queue_depth,
        queue_timeout: Duration::from_millis(queue_timeout_ms),
        aliases: vec![format!("{}-model", name)],
    }
}

/// Application state serving the given backends
pub fn app_state(
    backends: Vec<(BackendDescriptor, Arc<dyn TextBackend>)>,
    default_backend: Option<&str>,
) -> Arc<AppState> {
    app_state_with(Settings::default(), backends, default_backend)
}

pub fn app_state_with(
    settings: Settings,
    backends: Vec<(BackendDescriptor, Arc<dyn TextBackend>)>,
    default_backend: Option<&str>,
) -> Arc<AppState> {
    let mut snapshot = RegistrySnapshot::new(default_backend.map(str::to_string));
    for (descriptor, client) in backends {
        snapshot.insert(descriptor, client).unwrap();
    }
    Arc::new(AppState::with_snapshot(settings, snapshot, None))
}

pub fn chat_body(model: Option<&str>, stream: bool) -> String {
    let mut body = serde_json::json!({
        "messages": [{"role": "user", "content": "Say hello"}],
        "stream": stream,
    });
    if let Some(model) = model {
        body["model"] = serde_json::json!(model);
    }
    body.to_string()
}

pub fn chat_request(body: String) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

/// Poll `condition` until it holds or a second has passed
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// One SSE `data:` frame per payload, ending with `[DONE]`
pub fn sse_body(payloads: &[serde_json::Value]) -> String {
    let mut body: String = payloads
        .iter()
        .map(|p| format!("data: {}\n\n", p))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn delta_chunk(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    })
}

pub fn finish_chunk(reason: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]
    })
}

pub fn backend_config(name: &str, endpoint: &str) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        timeout_ms: 500,
        ..Default::default()
    }
}

/// An upstream that streams `deltas` SSE chunks and then drops the connection
pub async fn spawn_dropping_upstream(deltas: Vec<&'static str>) -> SocketAddr {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let deltas = deltas.clone();
            async move {
                let frames = deltas.into_iter().map(|d| {
                    Ok::<_, std::io::Error>(Bytes::from(format!("data: {}\n\n", delta_chunk(d))))
                });
                let broken = stream::once(async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "backend crashed",
                    ))
                });
                axum::response::Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream::iter(frames).chain(broken)))
                    .unwrap()
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// An address nothing listens on
pub async fn refused_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
