mod common;

use axum::http::StatusCode;
use common::*;
use futures_util::StreamExt;
use serde_json::json;
use turnstream::types::*;

#[tokio::test]
async fn test_streamed_turn_is_relayed_and_saved() {
    let upstream = format!("{}{}data: [DONE]\n\n", delta("Hel"), delta("lo"));
    let app = TestApp::with_upstream(sse_upstream(upstream)).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "hi" })),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(
        resp.headers().get("cache-control").and_then(|v| v.to_str().ok()),
        Some("no-cache, no-transform")
    );
    assert_eq!(
        resp.headers().get("x-accel-buffering").and_then(|v| v.to_str().ok()),
        Some("no")
    );

    let payloads = sse_payloads(&body_text(resp).await);
    assert_eq!(payloads.first().map(String::as_str), Some(r#"{"__open":1}"#));
    assert!(payloads.contains(&r#"{"content":"Hel"}"#.to_string()));
    assert!(payloads.contains(&r#"{"content":"lo"}"#.to_string()));
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(payloads.iter().filter(|p| *p == "[DONE]").count(), 1);

    let turns = app.store().list_turns(&sid).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "hi");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].content, "Hello");

    let snapshot = app.store().get_debug_snapshot(&sid).await.unwrap().unwrap();
    assert_eq!(snapshot["completed"], true);
    assert_eq!(snapshot["upstream_status"], 200);
}

#[tokio::test]
async fn test_empty_completion_rolls_back_user_turn() {
    let app = TestApp::with_upstream(sse_upstream("data: [DONE]\n\n")).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "anything?" })),
        )
        .await;
    let payloads = sse_payloads(&body_text(resp).await);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

    assert!(app.store().list_turns(&sid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_whole_body_reply_is_passed_through() {
    let upstream = json_upstream(
        StatusCode::OK,
        json!({ "choices": [{ "message": { "role": "assistant", "content": "Whole answer" } }] }),
    );
    let app = TestApp::with_upstream(upstream).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "hi", "stream": false })),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Whole answer");

    let turns = app.store().list_turns(&sid).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "Whole answer");
}

#[tokio::test]
async fn test_upstream_error_is_sanitized_and_rolled_back() {
    let upstream = json_upstream(
        StatusCode::UNAUTHORIZED,
        json!({ "error": {
            "message": "Incorrect API key: sk-abcdefghijklmnop1234",
            "type": "invalid_request_error",
            "code": "invalid_api_key"
        } }),
    );
    let app = TestApp::with_upstream(upstream).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "hi" })),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    let message = body["error"]["message"].as_str().unwrap();
    assert!(!message.contains("abcdefghijklmnop"), "leaked key: {}", message);
    assert!(message.ends_with("1234"));
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["upstream_code"], "invalid_api_key");

    assert!(app.store().list_turns(&sid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upstream_not_found_rolls_back() {
    // The mock has no routes, so every upstream call answers 404.
    let app = TestApp::with_upstream(axum::Router::new()).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "hi" })),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(app.store().list_turns(&sid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_client_disconnect_keeps_partial_answer() {
    let app = TestApp::with_upstream(hanging_upstream(delta("partial"))).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "tell me a long story" })),
        )
        .await;
    let mut body = resp.into_body().into_data_stream();
    let mut seen = String::new();
    while !seen.contains("partial") {
        match body.next().await {
            Some(Ok(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk)),
            other => panic!("stream ended before content: {:?}", other.map(|r| r.is_ok())),
        }
    }
    drop(body);

    let store = app.state.store.clone();
    let sid2 = sid.clone();
    let saved = eventually(|| {
        let store = store.clone();
        let sid = sid2.clone();
        async move {
            matches!(
                store.latest_turn(&sid).await,
                Ok(Some(t)) if t.role == Role::Assistant && t.content == "partial"
            )
        }
    })
    .await;
    assert!(saved, "partial answer was not persisted after disconnect");

    let snapshot_written = eventually(|| {
        let store = store.clone();
        let sid = sid2.clone();
        async move {
            matches!(
                store.get_debug_snapshot(&sid).await,
                Ok(Some(s)) if s["outcome"] == "disconnected"
            )
        }
    })
    .await;
    assert!(snapshot_written);
}

#[tokio::test]
async fn test_upstream_silence_times_out_with_partial() {
    let app = TestApp::with_upstream(hanging_upstream(delta("slow"))).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "hi" })),
        )
        .await;
    // Inactivity timeout is two seconds in the test app.
    let payloads = sse_payloads(&body_text(resp).await);
    assert!(payloads.contains(&r#"{"content":"slow"}"#.to_string()));
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

    let latest = app.store().latest_turn(&sid).await.unwrap().unwrap();
    assert_eq!(latest.content, "slow");
    let snapshot = app.store().get_debug_snapshot(&sid).await.unwrap().unwrap();
    assert_eq!(snapshot["outcome"], "timed_out");
}

#[tokio::test]
async fn test_broken_upstream_saves_partial_and_reports_error() {
    let app = TestApp::with_upstream(broken_upstream(delta("half"))).await;
    let sid = app.create_session().await;

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "message": "hi" })),
        )
        .await;
    let payloads = sse_payloads(&body_text(resp).await);
    assert!(payloads.contains(&r#"{"content":"half"}"#.to_string()));
    assert!(payloads.iter().any(|p| p.contains("\"error\"")));
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

    let latest = app.store().latest_turn(&sid).await.unwrap().unwrap();
    assert_eq!(latest.role, Role::Assistant);
    assert_eq!(latest.content, "half");
}

#[tokio::test]
async fn test_continue_appends_to_last_assistant_turn() {
    let upstream = format!("{}data: [DONE]\n\n", delta("more text"));
    let app = TestApp::with_upstream(sse_upstream(upstream)).await;
    let sid = app.create_session().await;
    app.store().create_turn(&sid, Role::User, "q").await.unwrap();
    let answer = app
        .store()
        .create_turn(&sid, Role::Assistant, "first part")
        .await
        .unwrap();

    let resp = app
        .request(
            "POST",
            &format!("/api/sessions/{}/chat", sid),
            Some(json!({ "continue": true })),
        )
        .await;
    let _ = body_text(resp).await;

    let turns = app.store().list_turns(&sid).await.unwrap();
    assert_eq!(turns.len(), 2);
    let updated = app.store().get_turn(&answer.id).await.unwrap().unwrap();
    assert_eq!(updated.content, "first part\n\nmore text");
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let app = TestApp::with_upstream(sse_upstream("data: [DONE]\n\n")).await;
    let sid = app.create_session().await;

    let resp = app
        .request("POST", &format!("/api/sessions/{}/chat", sid), Some(json!({})))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let resp = app
        .request(
            "POST",
            "/api/sessions/missing/chat",
            Some(json!({ "message": "hi" })),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_caller_request_id_is_echoed() {
    let app = TestApp::with_upstream(sse_upstream("data: [DONE]\n\n")).await;
    let request = axum::http::Request::builder()
        .uri("/health")
        .header("x-request-id", "trace-me-42")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = tower::util::ServiceExt::oneshot(app.router.clone(), request)
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("trace-me-42")
    );
}
