use crate::constants::MAX_RETAINED_FRAMES;
use crate::redaction::{redact_headers, redact_value, RedactionLevel};
use crate::store::ConversationStore;
use crate::types::{RequestId, SessionId};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Instant;

/// Diagnostics for one relayed request, saved as the session's debug snapshot
/// whatever the outcome.
#[derive(Serialize, Debug)]
pub struct StreamRecorder {
    pub request_id: String,
    pub session_id: String,
    pub model: String,
    pub phase: String,
    pub outcome: String,
    pub upstream_status: Option<u16>,
    pub upstream_kind: Option<&'static str>,
    pub headers: Value,
    pub frames: VecDeque<String>,
    pub dropped_frames: usize,
    pub completed: bool,
    pub final_text: String,
    pub prompt_fingerprint: String,
    pub was_truncated: bool,
    pub removed_count: usize,
    pub started_at: String,
    pub duration_ms: u64,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    max_frames: usize,
    #[serde(skip)]
    redaction_level: RedactionLevel,
}

impl StreamRecorder {
    pub fn new(request_id: &RequestId, session_id: &SessionId, model: &str) -> Self {
        Self {
            request_id: request_id.0.clone(),
            session_id: session_id.0.clone(),
            model: model.to_string(),
            phase: "init".to_string(),
            outcome: "pending".to_string(),
            upstream_status: None,
            upstream_kind: None,
            headers: Value::Null,
            frames: VecDeque::new(),
            dropped_frames: 0,
            completed: false,
            final_text: String::new(),
            prompt_fingerprint: String::new(),
            was_truncated: false,
            removed_count: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
            duration_ms: 0,
            started: Instant::now(),
            max_frames: MAX_RETAINED_FRAMES,
            redaction_level: RedactionLevel::default(),
        }
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames.max(1);
        self
    }

    pub fn with_redaction_level(mut self, level: RedactionLevel) -> Self {
        self.redaction_level = level;
        self
    }

    pub fn record_phase(&mut self, phase: &str) {
        tracing::debug!(request_id = %self.request_id, phase, "Relay phase");
        self.phase = phase.to_string();
    }

    pub fn record_upstream(&mut self, status: StatusCode, headers: &HeaderMap, kind: &'static str) {
        self.upstream_status = Some(status.as_u16());
        self.upstream_kind = Some(kind);
        self.headers = redact_headers(headers);
    }

    /// Keeps the most recent frames only.
    pub fn record_frame(&mut self, line: &str) {
        if self.frames.len() >= self.max_frames {
            self.frames.pop_front();
            self.dropped_frames += 1;
        }
        self.frames.push_back(line.to_string());
    }

    pub fn finish(&mut self, outcome: &str, completed: bool, final_text: &str) {
        self.outcome = outcome.to_string();
        self.completed = completed;
        self.final_text = final_text.to_string();
        self.duration_ms = self.started.elapsed().as_millis() as u64;
    }

    pub fn to_snapshot(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(mut v) => {
                redact_value(&mut v, self.redaction_level);
                v
            }
            Err(e) => {
                tracing::error!("Failed to serialize stream recorder: {}", e);
                Value::Null
            }
        }
    }

    /// Persistence failures are logged, never propagated.
    pub async fn persist(&self, store: &dyn ConversationStore) {
        let snapshot = self.to_snapshot();
        if snapshot.is_null() {
            return;
        }
        let session = SessionId(self.session_id.clone());
        if let Err(e) = store.save_debug_snapshot(&session, &snapshot).await {
            tracing::warn!(
                request_id = %self.request_id,
                "Failed to persist debug snapshot: {}",
                e
            );
        }
    }
}
