//! Error Extraction Pipeline
//!
//! Turns raw upstream failures into one short, human-safe message. Every
//! function here is total: malformed input degrades to a plainer message, never
//! to a panic.

use crate::constants::{AUTHENTICATION_FAILS_MARKER, STREAM_INTERRUPTED_MESSAGE, UNKNOWN_ERROR};
use crate::str_utils::mask_keep_suffix;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{json, Value};

lazy_static! {
    static ref LEADING_TAG: Option<Regex> = Regex::new(r"^\[[^\]]*\]\s*").ok();
    static ref INPUT_STREAM: Option<Regex> = Regex::new(r"(?i)input\s+stream").ok();
    static ref API_KEY_PATTERN: Option<Regex> = Regex::new(r"(?i)(api key:\s*)(\S+)").ok();
}

/// Reduces a raw error string to the part a user can act on.
pub fn extract_useful_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let untagged = match LEADING_TAG.as_ref() {
        Some(re) => re.replace(trimmed, "").into_owned(),
        None => trimmed.to_string(),
    };

    if INPUT_STREAM
        .as_ref()
        .is_some_and(|re| re.is_match(&untagged))
    {
        return STREAM_INTERRUPTED_MESSAGE.to_string();
    }

    if let Some(idx) = untagged.find(AUTHENTICATION_FAILS_MARKER) {
        return untagged[idx..].trim().to_string();
    }

    match untagged.rfind(':') {
        Some(idx) => {
            let tail = untagged[idx + 1..].trim();
            if tail.is_empty() {
                untagged.trim().to_string()
            } else {
                tail.to_string()
            }
        }
        None => untagged.trim().to_string(),
    }
}

/// Masks the token following `api key:` so only its last four characters remain.
pub fn sanitize_error_message(msg: &str) -> String {
    if msg.is_empty() {
        return String::new();
    }
    let Some(re) = API_KEY_PATTERN.as_ref() else {
        return msg.to_string();
    };
    re.replace_all(msg, |caps: &Captures| {
        format!("{}{}", &caps[1], mask_keep_suffix(&caps[2], 4))
    })
    .into_owned()
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.trim().is_empty())
}

/// Picks the most specific message out of a parsed error body.
pub fn extract_error_from_response(err_data: &Value, status_text: Option<&str>) -> String {
    let chosen = non_empty_str(&err_data["__rawText"])
        .or_else(|| non_empty_str(&err_data["error"]["message"]))
        .or_else(|| non_empty_str(&err_data["error"]))
        .or_else(|| non_empty_str(&err_data["message"]))
        .or(status_text.filter(|s| !s.trim().is_empty()))
        .unwrap_or(UNKNOWN_ERROR);
    // Masking first keeps a key intact enough to mask even when extraction
    // would cut its `api key:` prefix off.
    sanitize_error_message(&extract_useful_error(&sanitize_error_message(chosen)))
}

/// Provider-specific `type` and `code` fields, when the body carries them.
pub fn extract_error_kind(err_data: &Value) -> (Option<String>, Option<Value>) {
    let error = &err_data["error"];
    let error_type = error["type"].as_str().map(str::to_string);
    let code = match &error["code"] {
        Value::Null => None,
        other => Some(other.clone()),
    };
    (error_type, code)
}

/// Parses a body as JSON, keeping the raw text when it is not.
pub fn parse_body(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(v) => v,
        Err(_) => json!({ "__rawText": text }),
    }
}

/// Reads a response body without ever failing.
pub async fn safe_json(response: reqwest::Response) -> Value {
    match response.text().await {
        Ok(text) => parse_body(&text),
        Err(e) => {
            tracing::debug!("Failed to read error body: {}", e);
            json!({ "__parseError": true })
        }
    }
}
