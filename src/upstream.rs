use crate::error_extraction::{extract_error_from_response, extract_error_kind, parse_body};
use crate::provider_config::{UpstreamConfig, UpstreamRequest};
use crate::types::{RelayError, Result};
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// The upstream answer, classified once right after the call returns.
pub enum UpstreamReply {
    /// A complete body. Also used when a stream was requested but the upstream
    /// answered with something other than an event stream.
    Whole {
        status: StatusCode,
        headers: HeaderMap,
        body: Value,
    },
    Incremental {
        status: StatusCode,
        headers: HeaderMap,
        stream: ByteStream,
    },
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
}

/// Application-level failure carried by a whole body, if any. A 2xx body with
/// an `error` field counts as a failure too.
pub fn whole_body_error(status: StatusCode, body: &Value) -> Option<RelayError> {
    let has_error_field = body.get("error").is_some_and(|e| !e.is_null());
    if status.is_success() && !has_error_field {
        return None;
    }
    let (error_type, code) = extract_error_kind(body);
    Some(RelayError::Upstream {
        status,
        message: extract_error_from_response(body, status.canonical_reason()),
        error_type,
        code,
    })
}

/// Assistant text from a whole chat-completions body.
pub fn whole_body_content(body: &Value) -> Option<&str> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .or_else(|| body["content"].as_str())
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    inactivity: Duration,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, inactivity: Duration) -> Self {
        Self { http, inactivity }
    }

    /// Issues the call. Transport failures and a silent upstream are fatal for
    /// the request and never retried here.
    pub async fn send(
        &self,
        config: &UpstreamConfig,
        request: &UpstreamRequest,
    ) -> Result<UpstreamReply> {
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let call = self
            .http
            .post(&config.url)
            .bearer_auth(&config.api_key)
            .header(reqwest::header::ACCEPT, accept)
            .json(request)
            .send();

        let response = match tokio::time::timeout(self.inactivity, call).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(RelayError::Network(e).into()),
            Err(_) => return Err(RelayError::UpstreamTimeout(self.inactivity.as_secs()).into()),
        };

        let status = response.status();
        let headers = response.headers().clone();
        tracing::debug!(
            status = status.as_u16(),
            streaming = is_event_stream(&headers),
            "Upstream responded"
        );

        if status.is_success() && is_event_stream(&headers) {
            let stream = response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed();
            return Ok(UpstreamReply::Incremental {
                status,
                headers,
                stream,
            });
        }

        let text = self.read_whole_body(response).await?;

        Ok(UpstreamReply::Whole {
            status,
            headers,
            body: parse_body(&text),
        })
    }

    /// Reads a complete body. The inactivity bound restarts with every chunk,
    /// so a slow body that keeps arriving is never cut off.
    async fn read_whole_body(&self, response: reqwest::Response) -> Result<String> {
        let mut chunks = response.bytes_stream();
        let mut body = Vec::new();
        loop {
            match tokio::time::timeout(self.inactivity, chunks.next()).await {
                Ok(Some(Ok(chunk))) => body.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => return Err(RelayError::Network(e).into()),
                Ok(None) => break,
                Err(_) => {
                    return Err(RelayError::UpstreamTimeout(self.inactivity.as_secs()).into())
                }
            }
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
