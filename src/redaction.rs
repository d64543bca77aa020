use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    Strict,  // Production - secrets plus conversation text
    Normal,  // Development - secrets plus oversized blobs
    Minimal, // Debug - only known secret keys
}

impl Default for RedactionLevel {
    fn default() -> Self {
        match std::env::var("REDACTION_LEVEL")
            .unwrap_or_else(|_| "normal".to_string())
            .to_lowercase()
            .as_str()
        {
            "strict" => RedactionLevel::Strict,
            "minimal" => RedactionLevel::Minimal,
            _ => RedactionLevel::Normal,
        }
    }
}

const LARGE_STRING_CHARS: usize = 4000;

fn is_secret_key(k_lower: &str) -> bool {
    k_lower.contains("key")
        || k_lower.contains("auth")
        || k_lower.contains("token")
        || k_lower.contains("secret")
        || k_lower.contains("password")
        || k_lower == "cookie"
        || k_lower == "set-cookie"
}

pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                let k_lower = k.to_lowercase();

                if is_secret_key(&k_lower) && !val.is_object() && !val.is_array() {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                match level {
                    RedactionLevel::Strict => {
                        if k_lower == "content" || k_lower == "final_text" || k_lower == "frames" {
                            *val = Value::String("[REDACTED-STRICT]".to_string());
                        } else {
                            redact_value(val, level);
                        }
                    }
                    RedactionLevel::Normal => {
                        let oversized = val
                            .as_str()
                            .is_some_and(|s| s.chars().count() > LARGE_STRING_CHARS);
                        if oversized {
                            *val = Value::String("[REDACTED-LARGE]".to_string());
                        } else {
                            redact_value(val, level);
                        }
                    }
                    RedactionLevel::Minimal => {
                        redact_value(val, level);
                    }
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val, level);
            }
        }
        _ => {}
    }
}

/// Headers as a JSON object with credential-bearing values masked.
pub fn redact_headers(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for (name, value) in headers {
        let key = name.as_str().to_string();
        let rendered = if is_secret_key(&key.to_lowercase()) {
            "[REDACTED]".to_string()
        } else {
            value.to_str().unwrap_or("[non-ascii]").to_string()
        };
        out.insert(key, Value::String(rendered));
    }
    Value::Object(out)
}
