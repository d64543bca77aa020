//! Issues chat requests against the relay and routes the outcome to a
//! [`ChatHandler`].

use super::consumer::read_stream;
use crate::error_extraction::{extract_error_from_response, safe_json};
use crate::types::{ChatRequest, SessionId};
use crate::upstream::is_event_stream;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Callbacks for one chat request. Only the content paths and the hard error
/// path are mandatory.
pub trait ChatHandler: Send {
    fn on_non_stream(&mut self, body: &Value);
    /// Running total after each delta.
    fn on_chunk(&mut self, accumulated: &str);
    fn on_error(&mut self, message: &str);

    fn on_complete(&mut self, _content: &str) {}

    fn on_abort(&mut self, _partial: &str) {}

    /// The stream broke after some content arrived.
    fn on_partial_error(&mut self, partial: &str, message: &str) {
        tracing::warn!(
            chars = partial.chars().count(),
            "Stream ended early, keeping partial answer: {}",
            message
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    NonStream(Value),
    Complete(String),
    Aborted { partial: String },
    PartialError { partial: String, message: String },
    Failed { status: Option<u16>, message: String },
}

/// Clears the in-flight token however the request ends.
struct InFlight<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            in_flight: Mutex::new(None),
        }
    }

    /// Cancels the request in flight, if any. Returns whether one was cancelled.
    pub fn cancel(&self) -> bool {
        match self.in_flight.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn begin(&self, token: CancellationToken) -> (CancellationToken, InFlight<'_>) {
        if let Ok(mut slot) = self.in_flight.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        (
            token,
            InFlight {
                slot: &self.in_flight,
            },
        )
    }

    pub async fn send_chat<H: ChatHandler>(
        &self,
        session: &SessionId,
        request: &ChatRequest,
        handler: &mut H,
    ) -> ChatOutcome {
        self.send_chat_with(session, request, handler, CancellationToken::new())
            .await
    }

    /// Like [`ChatClient::send_chat`], cancelled through a token the caller
    /// keeps. The token is live before the request is sent, so cancelling
    /// while headers are still in flight works too.
    pub async fn send_chat_with<H: ChatHandler>(
        &self,
        session: &SessionId,
        request: &ChatRequest,
        handler: &mut H,
        token: CancellationToken,
    ) -> ChatOutcome {
        let (token, _in_flight) = self.begin(token);
        let url = format!("{}/api/sessions/{}/chat", self.base_url, session);
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let call = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, accept)
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                handler.on_abort("");
                return ChatOutcome::Aborted { partial: String::new() };
            }
            r = call => r,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let message = extract_error_from_response(&json!({ "message": e.to_string() }), None);
                handler.on_error(&message);
                return ChatOutcome::Failed {
                    status: e.status().map(|s| s.as_u16()),
                    message,
                };
            }
        };

        let status = response.status();
        let incremental = is_event_stream(response.headers());

        if !incremental {
            let body = safe_json(response).await;
            if !status.is_success() {
                let message = extract_error_from_response(&body, status.canonical_reason());
                handler.on_error(&message);
                return ChatOutcome::Failed {
                    status: Some(status.as_u16()),
                    message,
                };
            }
            handler.on_non_stream(&body);
            let content = body["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default();
            handler.on_complete(content);
            return ChatOutcome::NonStream(body);
        }

        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let mut partial = String::new();
        let result = {
            let read = read_stream(stream, |accumulated, delta| {
                partial.push_str(delta);
                handler.on_chunk(accumulated);
            });
            tokio::select! {
                r = read => Some(r),
                _ = token.cancelled() => None,
            }
        };

        match result {
            None => {
                tracing::debug!("Chat request cancelled by caller");
                handler.on_abort(&partial);
                ChatOutcome::Aborted { partial }
            }
            Some(Ok(content)) => {
                handler.on_complete(&content);
                ChatOutcome::Complete(content)
            }
            Some(Err(e)) if !e.partial.is_empty() => {
                let message = e.message();
                handler.on_partial_error(&e.partial, &message);
                ChatOutcome::PartialError {
                    partial: e.partial,
                    message,
                }
            }
            Some(Err(e)) => {
                let message = e.message();
                handler.on_error(&message);
                ChatOutcome::Failed {
                    status: e.status().or(Some(status.as_u16())),
                    message,
                }
            }
        }
    }
}

/// Handler that records every callback, for callers that only want the outcome.
#[derive(Debug, Default, Clone)]
pub struct RecordingHandler {
    pub chunks: Vec<String>,
    pub non_stream: Option<Value>,
    pub completed: Option<String>,
    pub aborted: Option<String>,
    pub partial_error: Option<(String, String)>,
    pub error: Option<String>,
}

impl ChatHandler for RecordingHandler {
    fn on_non_stream(&mut self, body: &Value) {
        self.non_stream = Some(body.clone());
    }

    fn on_chunk(&mut self, accumulated: &str) {
        self.chunks.push(accumulated.to_string());
    }

    fn on_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }

    fn on_complete(&mut self, content: &str) {
        self.completed = Some(content.to_string());
    }

    fn on_abort(&mut self, partial: &str) {
        self.aborted = Some(partial.to_string());
    }

    fn on_partial_error(&mut self, partial: &str, message: &str) {
        self.partial_error = Some((partial.to_string(), message.to_string()));
    }
}
