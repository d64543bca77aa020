#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use clap::Parser;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tower::util::ServiceExt;
use turnstream::db::SqliteStore;
use turnstream::server::build_router;
use turnstream::store::ConversationStore;
use turnstream::*;

pub const UPSTREAM_PATH: &str = "/v1/chat/completions";

/// Serves `app` on an ephemeral port and returns its base URL.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn event_stream(body: Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        body,
    )
        .into_response()
}

/// Upstream that streams `body` verbatim and closes.
pub fn sse_upstream(body: impl Into<String>) -> Router {
    let body: String = body.into();
    Router::new().route(
        UPSTREAM_PATH,
        post(move || {
            let body = body.clone();
            async move { event_stream(Body::from(body)) }
        }),
    )
}

/// Upstream that streams `first` and then goes silent without closing.
pub fn hanging_upstream(first: impl Into<String>) -> Router {
    let first: String = first.into();
    Router::new().route(
        UPSTREAM_PATH,
        post(move || {
            let first = first.clone();
            async move {
                let chunks = stream::iter(vec![Ok::<Bytes, std::io::Error>(Bytes::from(first))])
                    .chain(stream::pending());
                event_stream(Body::from_stream(chunks))
            }
        }),
    )
}

/// Upstream that streams `first` and then breaks the connection.
pub fn broken_upstream(first: impl Into<String>) -> Router {
    let first: String = first.into();
    Router::new().route(
        UPSTREAM_PATH,
        post(move || {
            let first = first.clone();
            async move {
                let chunks = stream::iter(vec![
                    Ok::<Bytes, std::io::Error>(Bytes::from(first)),
                    Err(std::io::Error::other("connection reset")),
                ]);
                event_stream(Body::from_stream(chunks))
            }
        }),
    )
}

/// Upstream that answers every call with a JSON body.
pub fn json_upstream(status: StatusCode, body: Value) -> Router {
    Router::new().route(
        UPSTREAM_PATH,
        post(move || {
            let body = body.clone();
            async move { (status, Json(body)).into_response() }
        }),
    )
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
}

impl TestApp {
    pub async fn with_upstream(upstream: Router) -> Self {
        let base = serve(upstream).await;
        let url = format!("{}{}", base, UPSTREAM_PATH);
        let args = Args::parse_from([
            "turnstream",
            "--upstream-url",
            url.as_str(),
            "--inactivity-timeout-secs",
            "2",
        ]);
        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let state = Arc::new(AppState::new(
            args,
            store,
            reqwest::Client::new(),
            "sk-test-key-0000000000000000".to_string(),
        ));
        let router = build_router(state.clone());
        Self { state, router }
    }

    pub fn store(&self) -> &dyn ConversationStore {
        self.state.store.as_ref()
    }

    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    pub async fn create_session(&self) -> SessionId {
        let resp = self
            .request("POST", "/api/sessions", Some(serde_json::json!({})))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let v = body_json(resp).await;
        SessionId(v["id"].as_str().unwrap().to_string())
    }
}

pub async fn body_text(resp: Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

pub async fn body_json(resp: Response) -> Value {
    serde_json::from_str(&body_text(resp).await).unwrap()
}

/// `data:` payloads of an event-stream body, in order.
pub fn sse_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|p| p.trim().to_string())
        .collect()
}

pub fn delta(content: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

/// Polls until `check` passes or a couple of seconds elapse.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}
