//! Test utilities: an in-process fake agent backend.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use cinder::BackoffPolicy;
use cinder::config::{BackendConfig, PullConfig, PushConfig};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Reply to one `POST /run_sse`.
#[derive(Debug, Clone)]
pub enum SseReply {
    Status(u16),
    /// Body delivered as these chunks, in order.
    Chunks(Vec<Bytes>),
}

/// One step of a scripted WebSocket connection.
#[derive(Debug, Clone)]
pub enum WsStep {
    Send(Value),
    /// Read client messages until one with this `type` arrives.
    Expect(&'static str),
    /// Close with this status code.
    Close(u16),
    /// Drop the connection without a close frame.
    Drop,
    /// Keep reading until the client goes away.
    Hang,
}

#[derive(Debug, Default)]
pub struct FakeState {
    sse_replies: Mutex<VecDeque<SseReply>>,
    ws_scripts: Mutex<VecDeque<Vec<WsStep>>>,
    pub sessions_created: AtomicU32,
    pub ws_connections: AtomicU32,
    /// Bodies of every `run_sse` request.
    pub sse_requests: Mutex<Vec<Value>>,
    /// Every text message a push client sent, plus `{"type":"<close>"}` markers
    /// for client close frames.
    pub ws_received: Mutex<Vec<Value>>,
}

impl FakeState {
    pub fn sse_requests(&self) -> Vec<Value> {
        self.sse_requests.lock().unwrap().clone()
    }

    pub fn ws_received(&self) -> Vec<Value> {
        self.ws_received.lock().unwrap().clone()
    }

    pub fn ws_received_of(&self, kind: &str) -> Vec<Value> {
        self.ws_received()
            .into_iter()
            .filter(|m| m["type"] == kind)
            .collect()
    }
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
    _server: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn spawn() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/apps/{app}/users/{user}/sessions", post(create_session))
            .route("/run_sse", post(run_sse))
            .route("/ws/{session}", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _server: server,
        }
    }

    pub fn push_sse(&self, reply: SseReply) {
        self.state.sse_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_ws(&self, script: Vec<WsStep>) {
        self.state.ws_scripts.lock().unwrap().push_back(script);
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: format!("http://{}", self.addr),
            app_name: "recovery_coordinator".to_string(),
            user_id: "tester".to_string(),
            bootstrap_timeout_secs: 5,
        }
    }

    pub fn pull_config(&self) -> PullConfig {
        PullConfig {
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            ws_url: format!("ws://{}", self.addr),
            heartbeat_timeout_secs: 5,
            max_reconnect_attempts: 3,
            ..Default::default()
        }
    }

    /// Poll until the push client has sent at least `count` messages.
    pub async fn wait_for_ws_messages(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.ws_received.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("push client never sent the expected messages");
    }
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20))
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_session(
    State(state): State<Arc<FakeState>>,
    Path((_app, _user)): Path<(String, String)>,
) -> Json<Value> {
    let n = state.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"id": format!("session-{n}"), "state": {}}))
}

async fn run_sse(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    state.sse_requests.lock().unwrap().push(body);
    let reply = state
        .sse_replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| SseReply::Chunks(vec![Bytes::from_static(b"data: [DONE]\n\n")]));

    match reply {
        SseReply::Status(code) => StatusCode::from_u16(code).unwrap().into_response(),
        SseReply::Chunks(chunks) => {
            let stream = futures::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
                .into_response()
        }
    }
}

async fn ws_upgrade(
    State(state): State<Arc<FakeState>>,
    Path(_session): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    let script = state
        .ws_scripts
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| vec![WsStep::Close(1000)]);
    ws.on_upgrade(move |socket| run_ws(socket, script, state))
}

async fn run_ws(mut socket: WebSocket, script: Vec<WsStep>, state: Arc<FakeState>) {
    for step in script {
        match step {
            WsStep::Send(value) => {
                if socket
                    .send(Message::Text(value.to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            WsStep::Expect(kind) => loop {
                match read_one(&mut socket, &state).await {
                    Some(value) if value["type"] == kind => break,
                    Some(_) => {}
                    None => return,
                }
            },
            WsStep::Close(code) => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: "done".into(),
                    })))
                    .await;
                return;
            }
            WsStep::Drop => return,
            WsStep::Hang => while read_one(&mut socket, &state).await.is_some() {},
        }
    }
}

/// Read the next text or close message, recording it. `None` once the client
/// is gone.
async fn read_one(socket: &mut WebSocket, state: &FakeState) -> Option<Value> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                state.ws_received.lock().unwrap().push(value.clone());
                return Some(value);
            }
            Ok(Message::Close(_)) => {
                let marker = json!({"type": "<close>"});
                state.ws_received.lock().unwrap().push(marker.clone());
                return Some(marker);
            }
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

// ============================================================================
// Payload builders
// ============================================================================

pub fn raw_text(invocation: &str, partial: bool, author: &str, text: &str) -> Value {
    json!({
        "id": format!("evt-{}", Uuid::new_v4().simple()),
        "invocationId": invocation,
        "author": author,
        "partial": partial,
        "content": {"role": "model", "parts": [{"text": text}]}
    })
}

pub fn raw_error(code: &str) -> Value {
    json!({
        "id": "evt-error",
        "errorCode": code,
        "errorMessage": "backend says no"
    })
}

pub fn canonical(agent: &str, target: &str, confidence: f64) -> Value {
    json!({
        "eventId": Uuid::new_v4().to_string(),
        "correlationId": Uuid::new_v4().to_string(),
        "parentEventId": null,
        "timestamp": "2026-08-14T17:30:00Z",
        "type": "alert",
        "severity": "critical",
        "sourceAgent": agent,
        "uiBinding": {"target": target},
        "content": {
            "summary": "Debris flow risk above Highway 9.",
            "detail": "Debris flow risk above Highway 9. Rain expected Friday.",
            "suggestedActions": []
        },
        "proofLayer": {
            "confidence": confidence,
            "citations": [],
            "reasoningChain": []
        }
    })
}

/// Encode events as an SSE body ending in the `[DONE]` sentinel.
pub fn sse_body(events: &[Value]) -> Vec<u8> {
    let mut body = String::from(": stream open\n\n");
    for event in events {
        body.push_str("data: ");
        body.push_str(&event.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}

/// Split a body into fixed-size chunks, ignoring line and character boundaries.
pub fn chunked(body: &[u8], size: usize) -> Vec<Bytes> {
    body.chunks(size).map(Bytes::copy_from_slice).collect()
}
