use crate::constants::REQUEST_ID_HEADER;
use crate::types::RequestId;
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

fn incoming_request_id(req: &Request<Body>) -> Option<RequestId> {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| RequestId(v.to_string()))
}

/// Tags every request with an id (reusing a caller-supplied one), exposes it
/// to handlers as an extension and echoes it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = incoming_request_id(&req).unwrap_or_else(RequestId::generate);
    req.extensions_mut().insert(request_id.clone());

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-relay counters, logged once when the relay finishes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamMetric {
    pub frames: usize,
    pub content_frames: usize,
    pub heartbeats: usize,
    pub malformed_frames: usize,
    pub text_chars: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn record_content(&mut self, delta: &str) {
        self.content_frames += 1;
        self.text_chars += delta.chars().count();
    }

    pub fn record_heartbeat(&mut self) {
        self.heartbeats += 1;
    }

    pub fn record_malformed(&mut self) {
        self.malformed_frames += 1;
    }

    pub fn log_summary(&self, request_id: &RequestId, outcome: &str) {
        if self.malformed_frames > 0 {
            warn!(
                target: "relay",
                "{}",
                format!(
                    "[STREAM] {} malformed frame(s) skipped for {}",
                    self.malformed_frames,
                    request_id.short()
                )
                .yellow()
            );
        }

        info!(
            target: "relay",
            "[STREAM END] Request: {} | Outcome: {} | Frames: {} | Content: {} | Heartbeats: {} | Text: {} chars",
            request_id.short(),
            outcome,
            self.frames,
            self.content_frames,
            self.heartbeats,
            self.text_chars
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_counts_characters() {
        let mut m = StreamMetric::new();
        m.record_frame();
        m.record_content("héllo");
        m.record_heartbeat();
        m.record_malformed();
        assert_eq!(m.frames, 1);
        assert_eq!(m.content_frames, 1);
        assert_eq!(m.text_chars, 5);
        assert_eq!(m.heartbeats, 1);
        assert_eq!(m.malformed_frames, 1);
    }

    #[test]
    fn test_incoming_request_id_is_reused_when_sane() {
        let req = match Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(Body::empty())
        {
            Ok(r) => r,
            Err(e) => panic!("request build failed: {}", e),
        };
        assert_eq!(incoming_request_id(&req), Some(RequestId("abc-123".into())));

        let long = "x".repeat(200);
        let req = match Request::builder()
            .header(REQUEST_ID_HEADER, long.as_str())
            .body(Body::empty())
        {
            Ok(r) => r,
            Err(e) => panic!("request build failed: {}", e),
        };
        assert_eq!(incoming_request_id(&req), None);
    }
}
