//! In-process mock of the chat backend for integration tests.
#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chat_client::{ApiClient, ClientConfig, StreamConsumer, TurnEvent, TurnHandle};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

const CHUNK_DELAY: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub enum StreamBehavior {
    /// Sends the chunks, then ends the body.
    Chunks(Vec<&'static str>),
    /// Sends the chunks, then keeps the connection open without writing.
    ChunksThenHang(Vec<&'static str>),
    Status(StatusCode),
    /// Reads the request and never sends response headers.
    Stall,
}

#[derive(Clone)]
pub enum FallbackBehavior {
    Reply(Value),
    Status(StatusCode, &'static str),
    /// Accepts the request and never answers.
    Hang,
}

#[derive(Clone)]
pub struct MockBackend {
    stream: StreamBehavior,
    fallback: FallbackBehavior,
    pub stream_calls: Arc<AtomicUsize>,
    pub fallback_calls: Arc<AtomicUsize>,
    pub last_request: Arc<Mutex<Option<Value>>>,
    pub last_auth: Arc<Mutex<Option<String>>>,
}

impl MockBackend {
    pub fn new(stream: StreamBehavior, fallback: FallbackBehavior) -> Self {
        Self {
            stream,
            fallback,
            stream_calls: Arc::new(AtomicUsize::new(0)),
            fallback_calls: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(None)),
            last_auth: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn fallback_calls(&self) -> usize {
        self.fallback_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<Value> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn last_auth(&self) -> Option<String> {
        self.last_auth.lock().unwrap().clone()
    }

    /// Serves the backend on an ephemeral port and returns its base URL.
    pub async fn spawn(&self) -> String {
        let app = Router::new()
            .route("/api/chat/stream", post(stream_handler))
            .route("/api/chat/send", post(send_handler))
            .route("/api/chat/sessions", get(sessions_handler))
            .route("/api/chat/messages/{id}", get(messages_handler))
            .route("/api/chat/new", post(new_chat_handler))
            .route("/api/models", get(models_handler))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

pub fn fallback_reply(id: &str, text: &str) -> FallbackBehavior {
    FallbackBehavior::Reply(json!({
        "success": true,
        "session_id": "s-fallback",
        "user_message": {"id": "u1", "text": "hello", "sender": "user", "model": null, "timestamp": null},
        "ai_message": {"id": id, "text": text, "sender": "ai", "model": null, "timestamp": "2024-05-01T10:00:00"},
    }))
}

async fn stream_handler(
    State(backend): State<MockBackend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    backend.stream_calls.fetch_add(1, Ordering::SeqCst);
    *backend.last_auth.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *backend.last_request.lock().unwrap() = Some(body);

    let (chunks, hang) = match backend.stream {
        StreamBehavior::Status(code) => {
            return (code, Json(json!({"error": "streaming unavailable"}))).into_response();
        }
        StreamBehavior::Stall => return std::future::pending::<Response>().await,
        StreamBehavior::Chunks(chunks) => (chunks, false),
        StreamBehavior::ChunksThenHang(chunks) => (chunks, true),
    };

    let sent = stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(CHUNK_DELAY).await;
        Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes()))
    });
    let body = if hang {
        Body::from_stream(sent.chain(stream::pending()))
    } else {
        Body::from_stream(sent)
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap()
}

async fn send_handler(State(backend): State<MockBackend>, Json(body): Json<Value>) -> Response {
    backend.fallback_calls.fetch_add(1, Ordering::SeqCst);
    *backend.last_request.lock().unwrap() = Some(body);

    match backend.fallback {
        FallbackBehavior::Reply(reply) => Json(reply).into_response(),
        FallbackBehavior::Status(code, message) => (code, Json(json!({"error": message}))).into_response(),
        FallbackBehavior::Hang => std::future::pending::<Response>().await,
    }
}

async fn sessions_handler() -> Json<Value> {
    Json(json!({
        "success": true,
        "sessions": [
            {"id": "s1", "title": "Rust question", "created_at": "2024-05-01T10:00:00", "updated_at": "2024-05-01T10:05:00", "message_count": 4},
            {"id": "s2", "title": null, "created_at": null, "updated_at": null, "message_count": 0},
        ],
    }))
}

async fn messages_handler(Path(id): Path<String>) -> Response {
    if id != "s1" {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Session not found"}))).into_response();
    }
    Json(json!({
        "success": true,
        "messages": [
            {"id": "u1", "text": "hi", "sender": "user", "model": null, "timestamp": "2024-05-01T10:00:00"},
            {"id": 17, "text": "hello `there`", "sender": "ai", "model": "GPT-4o", "timestamp": "2024-05-01T10:00:01"},
        ],
    }))
    .into_response()
}

async fn new_chat_handler() -> Json<Value> {
    Json(json!({"success": true, "session_id": "s-new", "session": {"id": "s-new", "title": "New Chat"}}))
}

async fn models_handler() -> Json<Value> {
    Json(json!({"success": true, "models": ["Gemini 2.5 Flash", "GPT-4o", "Claude 3.5 Sonnet", "DeepSeek V3"]}))
}

/// A server that accepts connections and never writes a byte. Returns its base URL.
pub async fn spawn_silent() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

/// Polls until `done` holds, failing the test after five seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn config(base_url: &str) -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_secs(5),
        stream_idle_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
    .with_base_url(base_url)
}

pub fn consumer(config: ClientConfig) -> StreamConsumer {
    StreamConsumer::new(ApiClient::new(config).unwrap())
}

/// Reads a turn to the end with a safety timeout.
pub async fn collect(handle: TurnHandle) -> Vec<TurnEvent> {
    tokio::time::timeout(Duration::from_secs(10), handle.collect::<Vec<_>>())
        .await
        .expect("turn did not finish in time")
}

pub fn progress_texts(events: &[TurnEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::Progress { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
