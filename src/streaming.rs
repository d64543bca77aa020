//! Server Streaming Relay
//!
//! Drives one chat request from the upstream call to finalization:
//!
//! `Init -> UpstreamCalling -> {UpstreamWhole, UpstreamSse} -> Relaying ->
//! {Completed, Disconnected, TimedOut, Errored} -> Finalized`
//!
//! The HTTP handler spawns [`Relay::run`] and waits on a oneshot for the
//! response head. Dropping the handler (client gone before the head) closes
//! that oneshot; dropping the SSE body closes the frame channel. Either is
//! observed before the next write and aborts the upstream call.

use crate::constants::{
    DOWNSTREAM_CHANNEL_CAPACITY, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_PAYLOAD, MAX_CARRY_BYTES,
    MAX_RETAINED_FRAMES, MAX_SSE_LINE_BYTES, OPENED_PAYLOAD, SSE_DATA_PREFIX, SSE_DONE_SENTINEL,
    UPSTREAM_INACTIVITY_TIMEOUT_SECS, CHECKPOINT_INTERVAL_MS,
};
use crate::debug_utils::StreamRecorder;
use crate::engine::TurnOperation;
use crate::logging::StreamMetric;
use crate::persistence::{ResponsePersister, SaveOutcome};
use crate::store::ConversationStore;
use crate::types::*;
use crate::upstream::{whole_body_content, whole_body_error, ByteStream, UpstreamClient, UpstreamReply};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

const MAX_STREAM_LINES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Init,
    UpstreamCalling,
    UpstreamWhole,
    UpstreamSse,
    Relaying,
    Completed,
    Disconnected,
    TimedOut,
    Errored,
    Finalized,
}

impl RelayPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayPhase::Init => "init",
            RelayPhase::UpstreamCalling => "upstream_calling",
            RelayPhase::UpstreamWhole => "upstream_whole",
            RelayPhase::UpstreamSse => "upstream_sse",
            RelayPhase::Relaying => "relaying",
            RelayPhase::Completed => "completed",
            RelayPhase::Disconnected => "disconnected",
            RelayPhase::TimedOut => "timed_out",
            RelayPhase::Errored => "errored",
            RelayPhase::Finalized => "finalized",
        }
    }
}

/// What the relay writes downstream, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Opened,
    Content(String),
    Heartbeat,
    Error(Value),
    Done,
}

impl Frame {
    pub fn payload(&self) -> String {
        match self {
            Frame::Opened => OPENED_PAYLOAD.to_string(),
            Frame::Content(delta) => json!({ "content": delta }).to_string(),
            Frame::Heartbeat => HEARTBEAT_PAYLOAD.to_string(),
            Frame::Error(body) => body.to_string(),
            Frame::Done => SSE_DONE_SENTINEL.to_string(),
        }
    }

    pub fn into_event(self) -> Event {
        Event::default().data(self.payload())
    }
}

/// Result of feeding one upstream line to the [`FrameParser`].
#[derive(Debug, Clone, PartialEq)]
pub enum LineAction {
    Done,
    Delta(String),
    UpstreamError(Value),
    /// Not a data line, or a data line without content.
    Ignored,
    /// Incomplete JSON kept for the next data line.
    Buffered,
    Malformed,
}

/// Parses upstream SSE lines, carrying incomplete JSON across lines.
#[derive(Debug, Default)]
pub struct FrameParser {
    carry: String,
}

fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(SSE_DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Content delta of a chat-completions chunk, tolerating a few shapes.
pub fn extract_delta(v: &Value) -> Option<&str> {
    let choice = &v["choices"][0];
    choice["delta"]["content"]
        .as_str()
        .or_else(|| choice["message"]["content"].as_str())
        .or_else(|| v["content"].as_str())
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_carry(&self) -> bool {
        !self.carry.is_empty()
    }

    fn classify(v: Value) -> LineAction {
        if v.get("error").is_some_and(|e| !e.is_null()) {
            return LineAction::UpstreamError(v);
        }
        match extract_delta(&v) {
            Some(delta) if !delta.is_empty() => LineAction::Delta(delta.to_string()),
            _ => LineAction::Ignored,
        }
    }

    pub fn feed_line(&mut self, line: &str) -> LineAction {
        let line = line.trim_end_matches('\r');
        let Some(payload) = data_payload(line) else {
            return LineAction::Ignored;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return LineAction::Ignored;
        }

        if payload == SSE_DONE_SENTINEL {
            if self.has_carry() {
                tracing::debug!("Dropping {} unparsed bytes at [DONE]", self.carry.len());
                self.carry.clear();
            }
            return LineAction::Done;
        }

        // A line that stands on its own wins over a stale fragment.
        let alone = match serde_json::from_str::<Value>(payload) {
            Ok(v) => {
                if self.has_carry() {
                    tracing::debug!("Dropping {} unparsed bytes before a complete frame", self.carry.len());
                    self.carry.clear();
                }
                return Self::classify(v);
            }
            Err(e) => e,
        };

        if self.has_carry() {
            let joined = format!("{}{}", self.carry, payload);
            match serde_json::from_str::<Value>(&joined) {
                Ok(v) => {
                    self.carry.clear();
                    return Self::classify(v);
                }
                Err(e) if e.is_eof() && joined.len() <= MAX_CARRY_BYTES => {
                    self.carry = joined;
                    return LineAction::Buffered;
                }
                Err(_) => {
                    self.carry.clear();
                }
            }
        }

        if alone.is_eof() && payload.len() <= MAX_CARRY_BYTES {
            self.carry = payload.to_string();
            LineAction::Buffered
        } else {
            LineAction::Malformed
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub heartbeat_interval: Duration,
    pub inactivity_timeout: Duration,
    pub checkpoint_interval: Duration,
    pub max_frames: usize,
    pub max_lines: usize,
    pub channel_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            inactivity_timeout: Duration::from_secs(UPSTREAM_INACTIVITY_TIMEOUT_SECS),
            checkpoint_interval: Duration::from_millis(CHECKPOINT_INTERVAL_MS),
            max_frames: MAX_RETAINED_FRAMES,
            max_lines: MAX_STREAM_LINES,
            channel_capacity: DOWNSTREAM_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayOutcome {
    pub phase: RelayPhase,
    pub content: String,
    pub saved: bool,
    pub rolled_back: bool,
}

/// Per-request state threaded through the relaying loop and finalization.
pub struct StreamContext {
    pub store: Arc<dyn ConversationStore>,
    pub persister: ResponsePersister,
    pub recorder: StreamRecorder,
    pub metric: StreamMetric,
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub settings: RelaySettings,
}

fn set_phase(recorder: &mut StreamRecorder, phase: RelayPhase) {
    tracing::Span::current().record("phase", phase.as_str());
    recorder.record_phase(phase.as_str());
}

/// Builds the downstream SSE response around the frame channel.
pub fn sse_response(rx: mpsc::Receiver<Frame>) -> Response {
    let events = ReceiverStream::new(rx).map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

pub struct StreamHandler;

impl StreamHandler {
    /// RELAYING through finalization. Returns once the downstream channel has
    /// received its terminal frame or the client is gone.
    pub async fn handle_stream(
        stream: ByteStream,
        tx: mpsc::Sender<Frame>,
        mut ctx: StreamContext,
    ) -> RelayOutcome {
        set_phase(&mut ctx.recorder, RelayPhase::Relaying);

        let mut lines = FramedRead::new(
            StreamReader::new(stream),
            LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES),
        );
        let settings = ctx.settings;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + settings.heartbeat_interval,
            settings.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let inactivity = tokio::time::sleep(settings.inactivity_timeout);
        tokio::pin!(inactivity);

        let mut parser = FrameParser::new();
        let mut accumulated = String::new();
        let mut last_checkpoint = Instant::now();
        let mut done_forwarded = false;
        let mut line_count = 0usize;

        let terminal = loop {
            tokio::select! {
                biased;

                _ = tx.closed() => {
                    break RelayPhase::Disconnected;
                }
                _ = &mut inactivity => {
                    break RelayPhase::TimedOut;
                }
                _ = heartbeat.tick() => {
                    if tx.send(Frame::Heartbeat).await.is_err() {
                        break RelayPhase::Disconnected;
                    }
                    ctx.metric.record_heartbeat();
                }
                next = lines.next() => {
                    let line = match next {
                        None => break RelayPhase::Completed,
                        Some(Ok(line)) => line,
                        Some(Err(e)) => {
                            tracing::warn!("Upstream stream failed mid-relay: {}", e);
                            let err: ObservedError =
                                RelayError::Io(std::io::Error::other(e.to_string())).into();
                            if tx.send(Frame::Error(err.to_body())).await.is_err() {
                                break RelayPhase::Disconnected;
                            }
                            break RelayPhase::Errored;
                        }
                    };
                    inactivity
                        .as_mut()
                        .reset(Instant::now() + settings.inactivity_timeout);

                    if line.trim().is_empty() {
                        continue;
                    }
                    line_count += 1;
                    if line_count > settings.max_lines {
                        tracing::error!("Stream exceeded max line limit ({})", settings.max_lines);
                        let err: ObservedError = RelayError::Upstream {
                            status: StatusCode::BAD_GATEWAY,
                            message: format!("upstream stream exceeded {} lines", settings.max_lines),
                            error_type: None,
                            code: None,
                        }
                        .into();
                        if tx.send(Frame::Error(err.to_body())).await.is_err() {
                            break RelayPhase::Disconnected;
                        }
                        break RelayPhase::Errored;
                    }
                    ctx.metric.record_frame();
                    ctx.recorder.record_frame(&line);

                    match parser.feed_line(&line) {
                        LineAction::Done => {
                            if tx.send(Frame::Done).await.is_err() {
                                break RelayPhase::Disconnected;
                            }
                            done_forwarded = true;
                            break RelayPhase::Completed;
                        }
                        LineAction::Delta(delta) => {
                            accumulated.push_str(&delta);
                            ctx.metric.record_content(&delta);
                            if tx.send(Frame::Content(delta)).await.is_err() {
                                break RelayPhase::Disconnected;
                            }
                            if last_checkpoint.elapsed() >= settings.checkpoint_interval {
                                last_checkpoint = Instant::now();
                                if let Err(e) = ctx
                                    .store
                                    .save_stream_checkpoint(&ctx.session_id, &ctx.request_id, &accumulated)
                                    .await
                                {
                                    tracing::warn!("Stream checkpoint failed: {}", e);
                                }
                            }
                        }
                        LineAction::UpstreamError(body) => {
                            let err: ObservedError = match whole_body_error(StatusCode::OK, &body) {
                                Some(e) => e.into(),
                                None => RelayError::internal("upstream error frame").into(),
                            };
                            tracing::warn!("Upstream reported an error mid-stream: {}", err);
                            if tx.send(Frame::Error(err.to_body())).await.is_err() {
                                break RelayPhase::Disconnected;
                            }
                            break RelayPhase::Errored;
                        }
                        LineAction::Malformed => {
                            ctx.metric.record_malformed();
                            tracing::trace!("Skipping malformed frame");
                        }
                        LineAction::Ignored | LineAction::Buffered => {}
                    }
                }
            }
        };

        // Leaving RELAYING: no more heartbeats, and dropping the reader
        // releases the upstream connection.
        drop(heartbeat);
        drop(lines);

        Self::finalize(tx, ctx, terminal, accumulated, done_forwarded).await
    }

    async fn finalize(
        tx: mpsc::Sender<Frame>,
        mut ctx: StreamContext,
        terminal: RelayPhase,
        accumulated: String,
        done_forwarded: bool,
    ) -> RelayOutcome {
        set_phase(&mut ctx.recorder, terminal);
        match terminal {
            RelayPhase::Disconnected => {
                tracing::warn!(
                    chars = accumulated.chars().count(),
                    "Client disconnected during relay; saving partial response"
                );
            }
            RelayPhase::TimedOut => {
                tracing::warn!(
                    timeout_secs = ctx.settings.inactivity_timeout.as_secs(),
                    "Upstream went silent; aborting relay"
                );
            }
            RelayPhase::Completed if accumulated.is_empty() => {
                tracing::info!("Upstream completed without content; nothing to save");
            }
            _ => {}
        }

        let saved = match ctx.persister.save(&accumulated).await {
            Ok(SaveOutcome::Skipped) => false,
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to persist relayed response: {}", e);
                false
            }
        };
        let rolled_back = match ctx.persister.rollback_if_empty(&accumulated).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Failed to roll back speculative turn: {}", e);
                false
            }
        };

        ctx.recorder
            .finish(terminal.as_str(), terminal == RelayPhase::Completed, &accumulated);
        ctx.recorder.persist(ctx.store.as_ref()).await;
        ctx.metric.log_summary(&ctx.request_id, terminal.as_str());

        if !done_forwarded && !tx.is_closed() {
            let _ = tx.send(Frame::Done).await;
        }
        set_phase(&mut ctx.recorder, RelayPhase::Finalized);

        RelayOutcome {
            phase: terminal,
            content: accumulated,
            saved,
            rolled_back,
        }
    }
}

/// Everything a relay needs besides the prepared request.
#[derive(Clone)]
pub struct Relay {
    pub store: Arc<dyn ConversationStore>,
    pub upstream: UpstreamClient,
    pub health: Arc<UpstreamHealth>,
    pub settings: RelaySettings,
}

impl Relay {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        upstream: UpstreamClient,
        health: Arc<UpstreamHealth>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            upstream,
            health,
            settings,
        }
    }

    async fn abandon(
        &self,
        mut persister: ResponsePersister,
        mut recorder: StreamRecorder,
        phase: RelayPhase,
    ) -> RelayOutcome {
        let rolled_back = match persister.rollback_if_empty("").await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!("Failed to roll back speculative turn: {}", e);
                false
            }
        };
        set_phase(&mut recorder, phase);
        recorder.finish(phase.as_str(), false, "");
        recorder.persist(self.store.as_ref()).await;
        RelayOutcome {
            phase,
            content: String::new(),
            saved: false,
            rolled_back,
        }
    }

    /// Runs one request end to end. The response head goes out through `head_tx`.
    pub async fn run(self, op: TurnOperation, head_tx: oneshot::Sender<Response>) -> RelayOutcome {
        let mut head_tx = head_tx;
        let mut recorder = StreamRecorder::new(&op.request_id, &op.session.id, &op.config.model)
            .with_max_frames(self.settings.max_frames);
        recorder.prompt_fingerprint = op.prompt_fingerprint.clone();
        recorder.was_truncated = op.was_truncated;
        recorder.removed_count = op.removed_count;
        set_phase(&mut recorder, RelayPhase::Init);

        let mut persister = ResponsePersister::new(
            self.store.clone(),
            op.session.id.clone(),
            op.request_id.clone(),
            op.speculative_turn.clone(),
            op.policy,
        );

        set_phase(&mut recorder, RelayPhase::UpstreamCalling);
        let reply = tokio::select! {
            r = self.upstream.send(&op.config, &op.payload) => r,
            _ = head_tx.closed() => {
                tracing::warn!("Client disconnected before upstream replied");
                return self.abandon(persister, recorder, RelayPhase::Disconnected).await;
            }
        };

        let reply = match reply {
            Ok(r) => r,
            Err(e) => {
                self.health.record_failure();
                tracing::error!("Upstream call failed: {}", e);
                let phase = if matches!(e.inner, RelayError::UpstreamTimeout(_)) {
                    RelayPhase::TimedOut
                } else {
                    RelayPhase::Errored
                };
                let _ = head_tx.send(e.into_response());
                return self.abandon(persister, recorder, phase).await;
            }
        };

        match reply {
            UpstreamReply::Whole {
                status,
                headers,
                body,
            } => {
                set_phase(&mut recorder, RelayPhase::UpstreamWhole);
                recorder.record_upstream(status, &headers, "whole");

                if let Some(err) = whole_body_error(status, &body) {
                    if status.is_server_error() {
                        self.health.record_failure();
                    } else {
                        self.health.record_success();
                    }
                    let err: ObservedError = err.into();
                    tracing::warn!("Upstream returned an error: {}", err);
                    let _ = head_tx.send(err.into_response());
                    return self.abandon(persister, recorder, RelayPhase::Errored).await;
                }
                self.health.record_success();

                let content = whole_body_content(&body).unwrap_or_default().to_string();
                let saved = match persister.save(&content).await {
                    Ok(SaveOutcome::Skipped) => false,
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!("Failed to persist response: {}", e);
                        false
                    }
                };
                let rolled_back = match persister.rollback_if_empty(&content).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        tracing::error!("Failed to roll back speculative turn: {}", e);
                        false
                    }
                };
                if content.is_empty() {
                    tracing::info!("Upstream returned no content; nothing to save");
                }

                set_phase(&mut recorder, RelayPhase::Completed);
                recorder.finish(RelayPhase::Completed.as_str(), true, &content);
                recorder.persist(self.store.as_ref()).await;

                if head_tx.send((status, Json(body)).into_response()).is_err() {
                    tracing::warn!("Client disconnected before the response was delivered");
                }
                RelayOutcome {
                    phase: RelayPhase::Completed,
                    content,
                    saved,
                    rolled_back,
                }
            }
            UpstreamReply::Incremental {
                status,
                headers,
                stream,
            } => {
                set_phase(&mut recorder, RelayPhase::UpstreamSse);
                recorder.record_upstream(status, &headers, "incremental");
                self.health.record_success();

                let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
                // Queued ahead of the body; never blocks on a fresh channel.
                let _ = tx.try_send(Frame::Opened);
                if head_tx.send(sse_response(rx)).is_err() {
                    // The receiver went with the response; the loop sees a closed channel.
                    tracing::debug!("Client gone before the stream head was sent");
                }

                let ctx = StreamContext {
                    store: self.store.clone(),
                    persister,
                    recorder,
                    metric: StreamMetric::new(),
                    session_id: op.session.id.clone(),
                    request_id: op.request_id.clone(),
                    settings: self.settings,
                };
                StreamHandler::handle_stream(stream, tx, ctx).await
            }
        }
    }

    /// Spawns [`Relay::run`] in its own task and hands back the response head.
    pub fn spawn(&self, op: TurnOperation) -> oneshot::Receiver<Response> {
        use tracing::Instrument;
        let (head_tx, head_rx) = oneshot::channel();
        let span = tracing::info_span!(
            "relay",
            request_id = %op.request_id,
            session_id = %op.session.id,
            phase = tracing::field::Empty
        );
        let relay = self.clone();
        tokio::spawn(async move { relay.run(op, head_tx).await }.instrument(span));
        head_rx
    }
}
