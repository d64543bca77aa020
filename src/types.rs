use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TurnId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl TurnId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for TurnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// --- STORED RECORDS ---

/// One persisted message of a session. `sequence` is the creation order and the
/// only ordering key; ids are never reused for ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    pub id: TurnId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub sequence: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub last_active_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    pub parent_turn_id: TurnId,
    pub version: u32,
    pub content: String,
    pub is_active: bool,
    pub created_at: String,
}

/// --- OUTGOING CONVERSATION ---

/// A role/content pair as sent upstream. The first entry of an outgoing list is
/// always the system turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

impl From<&TurnRecord> for ChatMessage {
    fn from(turn: &TurnRecord) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

/// --- INGRESS ---

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    /// Re-ask the model without new user input.
    #[serde(default)]
    pub regenerate: bool,
    /// Internal "keep going" directive; never persisted as a user turn.
    #[serde(default, alias = "continue")]
    pub continue_generation: bool,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// The user's new text, if this request carries any.
    pub fn user_input(&self) -> Option<&str> {
        if self.continue_generation {
            return None;
        }
        match self.message.as_deref().map(str::trim) {
            Some(m) if !m.is_empty() => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VariantRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NewSession {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// --- UPSTREAM HEALTH ---

pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub last_success: std::sync::RwLock<Option<Instant>>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_success: std::sync::RwLock::new(None),
        }
    }
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if let Ok(mut last) = self.last_success.write() {
            *last = Some(Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error (status {status}): {message}")]
    Upstream {
        status: StatusCode,
        message: String,
        error_type: Option<String>,
        code: Option<serde_json::Value>,
    },

    #[error("Upstream did not respond within {0}s")]
    UpstreamTimeout(u64),

    #[error("Could not allocate a variant version for {parent} after {attempts} attempts")]
    VersionAllocationFailed { parent: TurnId, attempts: u32 },

    #[error("Variant version {version} already exists for {parent}")]
    VariantVersionConflict { parent: TurnId, version: u32 },

    /// Another writer claimed the candidate version between read and check.
    #[error("Version {version} for {parent} was taken concurrently")]
    VersionRace { parent: TurnId, version: u32 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    pub fn internal(msg: impl Into<String>) -> Self {
        RelayError::Internal(msg.into(), SpanTrace::capture())
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Database(_) | RelayError::Migration(_) => "DATABASE_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::Network(_) => "NETWORK_ERROR",
            RelayError::Io(_) => "IO_ERROR",
            RelayError::InvalidRequest(_) => "INVALID_REQUEST",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::Upstream { .. } => "UPSTREAM_ERROR",
            RelayError::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            RelayError::VersionAllocationFailed { .. } => "VERSION_ALLOCATION_FAILED",
            RelayError::VariantVersionConflict { .. } => "VARIANT_VERSION_CONFLICT",
            RelayError::VersionRace { .. } => "VERSION_RACE",
            RelayError::Store(_) => "STORE_ERROR",
            RelayError::Internal(_, _) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Upstream { status, .. } => {
                if status.is_client_error() || status.is_server_error() {
                    *status
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Network(_) => StatusCode::BAD_GATEWAY,
            RelayError::VersionAllocationFailed { .. } | RelayError::VersionRace { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::VariantVersionConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may simply re-submit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::VersionAllocationFailed { .. }
                | RelayError::VariantVersionConflict { .. }
                | RelayError::VersionRace { .. }
                | RelayError::UpstreamTimeout(_)
                | RelayError::Network(_)
        )
    }

    /// Transient store or transport conditions worth an automatic retry.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Database(sqlx::Error::PoolTimedOut)
            | RelayError::Database(sqlx::Error::Io(_))
            | RelayError::Io(_)
            | RelayError::Store(_) => true,
            RelayError::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY / SQLITE_LOCKED
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl ObservedError {
    /// The structured error object handed to clients. Messages go through the
    /// same secret scrubbing as upstream errors.
    pub fn to_body(&self) -> serde_json::Value {
        let status = self.inner.status();
        let message = crate::error_extraction::sanitize_error_message(&self.inner.to_string());
        let mut error = serde_json::json!({
            "message": message,
            "code": self.inner.code(),
            "status": status.as_u16(),
            "retryable": self.inner.is_retryable(),
        });
        if let RelayError::Upstream {
            status: upstream_status,
            message,
            error_type,
            code,
        } = &self.inner
        {
            error["message"] = serde_json::json!(crate::error_extraction::sanitize_error_message(
                message
            ));
            error["upstream_status"] = serde_json::json!(upstream_status.as_u16());
            if let Some(t) = error_type {
                error["type"] = serde_json::json!(t);
            }
            if let Some(c) = code {
                error["upstream_code"] = c.clone();
            }
        }
        serde_json::json!({ "error": error })
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self.inner, RelayError::Internal(_, _) | RelayError::Database(_)) {
            tracing::error!("{}\n\nSpan Trace:\n{}", self.inner, self.span_trace);
        }
        (self.inner.status(), axum::Json(self.to_body())).into_response()
    }
}
