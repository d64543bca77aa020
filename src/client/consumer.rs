//! Reads the relay's event stream into content deltas.

use crate::constants::{MAX_SSE_LINE_BYTES, SSE_DONE_SENTINEL};
use crate::error_extraction::extract_error_from_response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

const DATA_PREFIX: &str = "data:";

#[derive(Debug, Error)]
pub enum StreamFailure {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// An `error` frame arrived in place of content.
    #[error("stream reported an error: {0}")]
    Reported(Value),
}

/// The stream broke before it ended; whatever arrived so far is kept.
#[derive(Debug, Error)]
#[error("stream interrupted after {} bytes: {source}", .partial.len())]
pub struct StreamReadError {
    pub partial: String,
    pub source: StreamFailure,
}

impl StreamReadError {
    /// User-facing message, run through the error pipeline.
    pub fn message(&self) -> String {
        match &self.source {
            StreamFailure::Io(e) => extract_error_from_response(&json!({ "message": e.to_string() }), None),
            StreamFailure::Reported(body) => extract_error_from_response(body, None),
        }
    }

    /// Status carried by a reported error frame.
    pub fn status(&self) -> Option<u16> {
        match &self.source {
            StreamFailure::Reported(body) => body["error"]["status"]
                .as_u64()
                .and_then(|s| u16::try_from(s).ok()),
            StreamFailure::Io(_) => None,
        }
    }
}

/// What a single line contributes.
#[derive(Debug, PartialEq)]
enum Line<'a> {
    Done,
    Content(&'a str),
    Skip,
}

fn classify(line: &str) -> Line<'_> {
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Skip;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest).trim_end_matches('\r');
    if payload.trim() == SSE_DONE_SENTINEL {
        return Line::Done;
    }
    Line::Content(payload)
}

fn frame_delta(v: &Value) -> Option<&str> {
    v.get("content")
        .and_then(Value::as_str)
        .or_else(|| v["choices"][0]["delta"]["content"].as_str())
}

fn is_error_frame(v: &Value) -> bool {
    v.get("error").is_some_and(|e| !e.is_null())
}

/// Consumes `stream` until `[DONE]` or end of input, calling `on_content`
/// with the running total and the new delta for every content frame.
///
/// Lines are split on `\n` with an optional preceding `\r`; UTF-8 sequences
/// split across chunks are reassembled before decoding. Frames that fail to
/// parse or carry no content are skipped. An `error` frame ends the read with
/// [`StreamFailure::Reported`].
pub async fn read_stream<S, F>(stream: S, mut on_content: F) -> Result<String, StreamReadError>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    F: FnMut(&str, &str),
{
    let mut lines = FramedRead::new(
        StreamReader::new(stream),
        LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES),
    );
    let mut accumulated = String::new();

    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(e) => {
                return Err(StreamReadError {
                    partial: accumulated,
                    source: std::io::Error::other(e.to_string()).into(),
                })
            }
        };
        match classify(&line) {
            Line::Done => break,
            Line::Skip => {}
            Line::Content(payload) => {
                let Ok(frame) = serde_json::from_str::<Value>(payload) else {
                    tracing::trace!("Skipping malformed frame");
                    continue;
                };
                if is_error_frame(&frame) {
                    return Err(StreamReadError {
                        partial: accumulated,
                        source: StreamFailure::Reported(frame),
                    });
                }
                let Some(delta) = frame_delta(&frame) else {
                    tracing::trace!("Skipping frame without content");
                    continue;
                };
                accumulated.push_str(delta);
                on_content(&accumulated, delta);
            }
        }
    }

    Ok(accumulated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    async fn collect(parts: Vec<Vec<u8>>) -> (String, Vec<(String, String)>) {
        let mut calls = Vec::new();
        let out = match read_stream(chunks(parts), |acc, delta| {
            calls.push((acc.to_string(), delta.to_string()))
        })
        .await
        {
            Ok(s) => s,
            Err(e) => panic!("read_stream failed: {}", e),
        };
        (out, calls)
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(classify("data: [DONE]"), Line::Done);
        assert_eq!(classify("data:[DONE]\r"), Line::Done);
        assert_eq!(classify("event: ping"), Line::Skip);
        assert_eq!(classify(": comment"), Line::Skip);
        assert_eq!(classify("data: {}\r"), Line::Content("{}"));
    }

    #[tokio::test]
    async fn test_accumulates_and_reports_both_values() {
        let (out, calls) = collect(vec![
            b"data: {\"content\":\"Hel\"}\n\ndata: {\"content\":\"lo\"}\n\n".to_vec(),
            b"data: [DONE]\n\n".to_vec(),
        ])
        .await;
        assert_eq!(out, "Hello");
        assert_eq!(
            calls,
            vec![
                ("Hel".to_string(), "Hel".to_string()),
                ("Hello".to_string(), "lo".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_done_discards_rest_of_flush() {
        let (out, calls) = collect(vec![
            b"data: {\"content\":\"A\"}\r\ndata: [DONE]\r\ndata: {\"content\":\"B\"}\r\n".to_vec(),
        ])
        .await;
        assert_eq!(out, "A");
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_skips_malformed_and_contentless_frames() {
        let (out, calls) = collect(vec![
            b"data: {\"__open\":1}\n\ndata: {bad\n\ndata: {\"__hb\":1}\n\n".to_vec(),
            b"data: {\"content\":\"ok\"}\n\n".to_vec(),
        ])
        .await;
        assert_eq!(out, "ok");
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_reassembles_split_multibyte_characters() {
        let frame = "data: {\"content\":\"héllo ✓\"}\n\n".as_bytes().to_vec();
        // Split inside the two-byte é.
        let cut = match frame.iter().position(|b| *b == 0xC3) {
            Some(i) => i + 1,
            None => panic!("fixture lost its multibyte char"),
        };
        let (out, _) = collect(vec![frame[..cut].to_vec(), frame[cut..].to_vec()]).await;
        assert_eq!(out, "héllo ✓");
    }

    #[tokio::test]
    async fn test_returns_content_without_done() {
        let (out, _) = collect(vec![b"data: {\"content\":\"tail\"}".to_vec()]).await;
        assert_eq!(out, "tail");
    }

    #[tokio::test]
    async fn test_error_keeps_partial() {
        let parts: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"content\":\"par\"}\n\n")),
            Err(std::io::Error::other("reset")),
        ];
        match read_stream(stream::iter(parts), |_, _| {}).await {
            Ok(s) => panic!("expected failure, got {:?}", s),
            Err(e) => assert_eq!(e.partial, "par"),
        }
    }

    #[tokio::test]
    async fn test_error_frame_ends_read_with_reported_failure() {
        let parts: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(
            b"data: {\"content\":\"so far\"}\n\ndata: {\"error\":{\"message\":\"[relay] upstream: overloaded\",\"status\":503}}\n\ndata: [DONE]\n\n",
        ))];
        match read_stream(stream::iter(parts), |_, _| {}).await {
            Ok(s) => panic!("expected failure, got {:?}", s),
            Err(e) => {
                assert_eq!(e.partial, "so far");
                assert!(matches!(e.source, StreamFailure::Reported(_)));
                assert_eq!(e.message(), "overloaded");
                assert_eq!(e.status(), Some(503));
            }
        }
    }

    #[tokio::test]
    async fn test_null_error_field_is_not_a_failure() {
        let (out, _) = collect(vec![b"data: {\"error\":null,\"content\":\"fine\"}\n\n".to_vec()]).await;
        assert_eq!(out, "fine");
    }
}
