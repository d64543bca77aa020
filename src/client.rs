//! Caller side of the relay: issuing requests and consuming the event stream.

pub mod consumer;
pub mod orchestrator;

pub use consumer::{read_stream, StreamFailure, StreamReadError};
pub use orchestrator::{ChatClient, ChatHandler, ChatOutcome, RecordingHandler};
