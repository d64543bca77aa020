#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod client;
pub mod constants;
pub mod db;
pub mod debug_utils;
pub mod engine;
pub mod error_extraction;
pub mod hardening;
pub mod health;
pub mod history_pruning;
pub mod logging;
pub mod main_helper;
pub mod ndjson_layer;
pub mod persistence;
pub mod prompt;
pub mod provider_config;
pub mod redaction;
pub mod redaction_layer;
pub mod server;
pub mod store;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod upstream;
pub mod variants;

pub use types::*;

pub use main_helper::{AppState, Args};
