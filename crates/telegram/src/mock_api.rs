//! In-process stand-in for the Bot API, for tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use {
    axum::{
        Json, Router,
        body::Bytes,
        extract::State,
        http::{StatusCode, Uri},
        response::{IntoResponse, Response},
        routing::post,
    },
    serde::Deserialize,
    serde_json::json,
    tokio::sync::oneshot,
};

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: i64,
    pub text: String,
    #[serde(default)]
    pub parse_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendChatActionRequest {
    pub chat_id: i64,
    pub action: String,
}

#[derive(Debug, Clone)]
pub enum Captured {
    SendMessage(SendMessageRequest),
    SendChatAction(SendChatActionRequest),
    Other { method: String },
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<Captured>>>,
    /// Answer this many sendMessage calls with HTTP 429 first.
    rate_limited: Arc<AtomicUsize>,
}

pub struct MockTelegramApi {
    pub bot: teloxide::Bot,
    state: MockState,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<tokio::task::JoinHandle<()>>,
}

impl MockTelegramApi {
    pub async fn start() -> Self {
        Self::start_rate_limited(0).await
    }

    pub async fn start_rate_limited(times: usize) -> Self {
        let state = MockState::default();
        state.rate_limited.store(times, Ordering::SeqCst);

        let app = Router::new()
            .route("/{*path}", post(handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve mock telegram api");
        });

        let api_url = reqwest::Url::parse(&format!("http://{addr}/")).expect("parse api url");
        let bot = teloxide::Bot::new("test-token").set_api_url(api_url);
        Self {
            bot,
            state,
            shutdown: Some(shutdown_tx),
            server: Some(server),
        }
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<(i64, String)> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Captured::SendMessage(m) => Some((m.chat_id, m.text)),
                _ => None,
            })
            .collect()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.expect("server join");
        }
    }
}

async fn handler(State(state): State<MockState>, uri: Uri, body: Bytes) -> Response {
    let method = uri.path().rsplit('/').next().unwrap_or_default().to_string();

    let captured = match method.as_str() {
        "SendMessage" => serde_json::from_slice(&body)
            .map(Captured::SendMessage)
            .unwrap_or(Captured::Other {
                method: method.clone(),
            }),
        "SendChatAction" => serde_json::from_slice(&body)
            .map(Captured::SendChatAction)
            .unwrap_or(Captured::Other {
                method: method.clone(),
            }),
        _ => Captured::Other {
            method: method.clone(),
        },
    };

    if matches!(captured, Captured::SendMessage(_))
        && state
            .rate_limited
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 1",
                "parameters": { "retry_after": 1 },
            })),
        )
            .into_response();
    }

    state.requests.lock().unwrap().push(captured);

    let result = match method.as_str() {
        "SendMessage" => json!({
            "message_id": 1,
            "date": 0,
            "chat": { "id": 42, "type": "private" },
            "text": "ok",
        }),
        _ => json!(true),
    };
    Json(json!({ "ok": true, "result": result })).into_response()
}
