/// Incremental wire format
pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";
pub const HEARTBEAT_PAYLOAD: &str = r#"{"__hb":1}"#;
pub const OPENED_PAYLOAD: &str = r#"{"__open":1}"#;

/// Relay timing defaults
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const UPSTREAM_INACTIVITY_TIMEOUT_SECS: u64 = 90;
pub const UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const CHECKPOINT_INTERVAL_MS: u64 = 1500;

/// Lines longer than this are treated as a broken upstream.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;
/// Unparseable fragments are carried into the next data line up to this size.
pub const MAX_CARRY_BYTES: usize = 64 * 1024;
pub const MAX_RETAINED_FRAMES: usize = 500;
pub const DOWNSTREAM_CHANNEL_CAPACITY: usize = 100;

/// Variant allocation
pub const VARIANT_MAX_ATTEMPTS: u32 = 3;
pub const VARIANT_BACKOFF_BASE_MS: u64 = 50;
pub const VARIANT_BACKOFF_STEP_MS: u64 = 25;
pub const VARIANT_FETCH_ATTEMPTS: u32 = 3;
pub const VARIANT_FETCH_BASE_DELAY_MS: u64 = 100;

/// History
pub const DEFAULT_HISTORY_CHAR_LIMIT: usize = 48_000;
pub const TRUNCATION_MARKER: &str =
    "\n\n[Note: earlier messages in this conversation were omitted to fit the context window.]";
pub const CONTINUATION_DIRECTIVE: &str =
    "Continue exactly where your previous reply stopped. Do not repeat what you already wrote.";
pub const ASSISTANT_APPEND_SEPARATOR: &str = "\n\n";

/// Error extraction
pub const STREAM_INTERRUPTED_MESSAGE: &str =
    "The stream was interrupted before the response finished. Please try again.";
pub const AUTHENTICATION_FAILS_MARKER: &str = "Authentication Fails";
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Upstream defaults
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PERSONA: &str = "You are a helpful, concise assistant.";
pub const PROMPT_CACHE_TTL_SECS: u64 = 30;
/// Model prefixes whose providers renamed `max_tokens`.
pub const MAX_COMPLETION_TOKENS_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

/// Readiness flips once the upstream has failed this many times in a row.
pub const UPSTREAM_FAILURE_STREAK_LIMIT: u32 = 5;

/// Database defaults
pub const DB_CHECKPOINT_RETENTION_DAYS: i64 = 7;
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA foreign_keys = ON",
];

pub const REQUEST_ID_HEADER: &str = "x-request-id";
