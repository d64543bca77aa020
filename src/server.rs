use crate::client::{read_stream, StreamFailure};
use crate::health;
use crate::logging::request_id_middleware;
use crate::str_utils::preview;
use crate::types::*;
use crate::upstream::{whole_body_content, whole_body_error, UpstreamReply};
use crate::AppState;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:session_id/turns", get(list_turns))
        .route("/api/sessions/:session_id/chat", post(chat))
        .route(
            "/api/turns/:turn_id/variants",
            get(list_variants).post(create_variant),
        )
        .route(
            "/api/turns/:turn_id/variants/:version/activate",
            post(activate_variant),
        )
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewSession>,
) -> Result<(StatusCode, Json<Session>)> {
    let session = state.store.create_session(new).await?;
    tracing::info!(session_id = %session.id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_turns(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Vec<TurnRecord>>> {
    if state.store.get_session(&session_id).await?.is_none() {
        return Err(RelayError::NotFound(format!("session {}", session_id)).into());
    }
    Ok(Json(state.store.list_turns(&session_id).await?))
}

/// The relay entry point. The response head comes back from the spawned
/// relay task, which keeps running the stream after this handler returns.
async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(request_id): Extension<RequestId>,
    Path(session_id): Path<SessionId>,
    Json(req): Json<ChatRequest>,
) -> Response {
    let span = tracing::info_span!(
        "chat.request",
        request_id = %request_id,
        session_id = %session_id,
        outcome = tracing::field::Empty
    );
    chat_inner(state, request_id, session_id, req, span.clone())
        .instrument(span)
        .await
}

async fn chat_inner(
    state: Arc<AppState>,
    request_id: RequestId,
    session_id: SessionId,
    req: ChatRequest,
    span: tracing::Span,
) -> Response {
    let op = match state.engine.prepare(&session_id, request_id, &req).await {
        Ok(op) => op,
        Err(e) => {
            span.record("outcome", "rejected");
            tracing::warn!("Rejected chat request: {}", e);
            return e.into_response();
        }
    };
    tracing::info!(
        model = %op.config.model,
        stream = req.stream,
        truncated = op.was_truncated,
        "Relaying chat turn"
    );
    tracing::debug!(input = %preview(req.user_input().unwrap_or_default(), 60), "User input");

    let head = state.relay.spawn(op);
    match head.await {
        Ok(response) => {
            span.record("outcome", response.status().as_u16());
            response
        }
        Err(_) => {
            span.record("outcome", "no_response");
            ObservedError::from(RelayError::internal("relay ended without a response"))
                .into_response()
        }
    }
}

async fn create_variant(
    State(state): State<Arc<AppState>>,
    Path(turn_id): Path<TurnId>,
    Json(req): Json<VariantRequest>,
) -> Result<(StatusCode, Json<Variant>)> {
    let op = state.engine.prepare_variant(&turn_id, &req).await?;

    let content = match state.upstream.send(&op.config, &op.payload).await {
        Ok(UpstreamReply::Whole { status, body, .. }) => {
            if let Some(err) = whole_body_error(status, &body) {
                if status.is_server_error() {
                    state.health.record_failure();
                }
                return Err(err.into());
            }
            state.health.record_success();
            whole_body_content(&body).unwrap_or_default().to_string()
        }
        // Some providers stream regardless of the request; collect it.
        Ok(UpstreamReply::Incremental { stream, .. }) => {
            state.health.record_success();
            read_stream(stream, |_, _| {})
                .await
                .map_err(|e| match e.source {
                    StreamFailure::Io(io) => RelayError::Io(io),
                    StreamFailure::Reported(body) => whole_body_error(StatusCode::BAD_GATEWAY, &body)
                        .unwrap_or_else(|| RelayError::internal("upstream error frame")),
                })?
        }
        Err(e) => {
            state.health.record_failure();
            return Err(e);
        }
    };
    if content.is_empty() {
        return Err(RelayError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: "upstream returned no content".into(),
            error_type: None,
            code: None,
        }
        .into());
    }

    let mut variant = state
        .allocator
        .allocate_and_create(&op.parent.id, &content)
        .await?;
    state.allocator.activate(&op.parent.id, variant.version).await?;
    variant.is_active = true;
    Ok((StatusCode::CREATED, Json(variant)))
}

async fn list_variants(
    State(state): State<Arc<AppState>>,
    Path(turn_id): Path<TurnId>,
) -> Result<Json<Vec<Variant>>> {
    Ok(Json(state.allocator.fetch_variants(&turn_id).await?))
}

async fn activate_variant(
    State(state): State<Arc<AppState>>,
    Path((turn_id, version)): Path<(TurnId, u32)>,
) -> Result<Json<serde_json::Value>> {
    state.allocator.activate(&turn_id, version).await?;
    Ok(Json(serde_json::json!({
        "parent_turn_id": turn_id,
        "version": version,
        "is_active": true,
    })))
}
