//! HTTP route tests
//!
//! Conversation management routes and stop handling, exercised with
//! `tower::ServiceExt::oneshot` against the axum router. Streams that need
//! frame-by-frame control use the scripted in-process upstream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use futures::StreamExt;
use serde_json::json;

use chatrelay::storage::Message;
use chatrelay::upstream::fake::ScriptedSource;

use common::{app_state, body_json, get, new_conversation, post_json, sse_data};

async fn idle_state() -> (chatrelay::server::AppState, tempfile::TempDir) {
    let (source, _handle) = ScriptedSource::new();
    app_state(Arc::new(source)).await
}

#[tokio::test]
async fn test_list_conversations_in_creation_order() {
    let (state, _tmp) = idle_state().await;

    let a = new_conversation(&state).await;
    let b = new_conversation(&state).await;
    let c = new_conversation(&state).await;

    let listed = body_json(get(&state, "/list_conversations").await).await;
    assert_eq!(listed, json!([a, b, c]));
}

#[tokio::test]
async fn test_history_of_unknown_conversation_is_empty() {
    let (state, _tmp) = idle_state().await;

    let response = get(&state, "/conversation_history?conversation_id=nope").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn test_send_message_rejects_unknown_conversation() {
    let (state, _tmp) = idle_state().await;

    let response = post_json(
        &state,
        "/send_message",
        json!({ "text": "Hello", "conversation_id": "missing" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        json!({ "error": "Invalid conversation_id" })
    );
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_send_message_rejects_unparsable_numbers() {
    let (state, _tmp) = idle_state().await;
    let cid = new_conversation(&state).await;

    let response = post_json(
        &state,
        "/send_message",
        json!({ "text": "Hello", "conversation_id": cid, "max_tokens": "lots" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(state.store.get(&cid).await.unwrap().is_empty());
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_send_message_appends_and_registers() {
    let (state, _tmp) = idle_state().await;
    let cid = new_conversation(&state).await;

    let response = post_json(
        &state,
        "/send_message",
        json!({ "text": "Hello", "conversation_id": cid }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let sid = body_json(response).await["stream_id"]
        .as_str()
        .unwrap()
        .to_string();

    let params = state.registry.params(&sid).expect("session registered");
    assert_eq!(params.conversation_id, cid);
    assert_eq!(params.temperature, 0.1);
    assert_eq!(params.top_p, 0.9);
    assert_eq!(params.max_tokens, 100);
    assert_eq!(
        state.store.get(&cid).await.unwrap(),
        vec![Message::user("Hello")]
    );
}

#[tokio::test]
async fn test_stop_stream_always_succeeds() {
    let (state, _tmp) = idle_state().await;

    let response = post_json(&state, "/stop_stream", json!({ "stream_id": "abc" })).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "status": "ok", "message": "Stop request for abc" })
    );
}

#[tokio::test]
async fn test_delete_conversation() {
    let (state, tmp) = idle_state().await;
    let cid = new_conversation(&state).await;
    assert!(tmp.path().join(format!("{}.json", cid)).exists());

    let response = post_json(&state, "/delete_conversation", json!({ "conversation_id": cid })).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
    assert!(!tmp.path().join(format!("{}.json", cid)).exists());

    let response = post_json(&state, "/delete_conversation", json!({ "conversation_id": cid })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await,
        json!({ "status": "error", "message": "Invalid conversation_id" })
    );
}

#[tokio::test]
async fn test_delete_pair_removes_user_and_reply() {
    let (state, _tmp) = idle_state().await;
    let cid = new_conversation(&state).await;
    for message in [
        Message::user("q1"),
        Message::assistant("a1"),
        Message::user("q2"),
        Message::assistant("a2"),
    ] {
        state.store.append(&cid, message).await.unwrap();
    }

    let response = post_json(
        &state,
        "/delete_pair",
        json!({ "conversation_id": cid, "pair_index": "0" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ok" }));

    let persisted = state.store.read_persisted(&cid).await.unwrap().unwrap();
    assert_eq!(persisted, vec![Message::user("q2"), Message::assistant("a2")]);
}

#[tokio::test]
async fn test_delete_pair_errors() {
    let (state, _tmp) = idle_state().await;
    let cid = new_conversation(&state).await;
    state.store.append(&cid, Message::user("q1")).await.unwrap();

    let cases = [
        (json!({ "conversation_id": "missing", "pair_index": 0 }), "Unknown conversation"),
        (json!({ "conversation_id": cid, "pair_index": 1 }), "Invalid pair_index"),
        (json!({ "conversation_id": cid, "pair_index": -1 }), "Invalid pair_index"),
        (json!({ "conversation_id": cid }), "Invalid pair_index"),
    ];
    for (body, message) in cases {
        let response = post_json(&state, "/delete_pair", body.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(
            body_json(response).await,
            json!({ "status": "error", "message": message }),
            "{}",
            body
        );
    }
    assert_eq!(state.store.get(&cid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_debug_print() {
    let (state, tmp) = idle_state().await;
    let cid = new_conversation(&state).await;

    let response = post_json(&state, "/debug_print", json!({ "conversation_id": cid })).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = post_json(&state, "/debug_print", json!({ "conversation_id": "missing" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .starts_with("File not found"));

    std::fs::write(tmp.path().join(format!("{}.json", cid)), "not json").unwrap();
    let response = post_json(&state, "/debug_print", json!({ "conversation_id": cid })).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_malformed_json_body_is_bad_request() {
    let (state, _tmp) = idle_state().await;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/stop_stream")
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let response = tower::ServiceExt::oneshot(chatrelay::server::router(state.clone()), request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());
}

/// Stop after the first delta: the client sees that delta and then
/// `[DONE]`, and only that delta is persisted.
#[tokio::test]
async fn test_stop_after_first_delta() {
    let (source, handle) = ScriptedSource::new();
    let (state, _tmp) = app_state(Arc::new(source)).await;
    let cid = new_conversation(&state).await;

    let response = post_json(
        &state,
        "/send_message",
        json!({ "text": "Hello", "conversation_id": cid }),
    )
    .await;
    let sid = body_json(response).await["stream_id"]
        .as_str()
        .unwrap()
        .to_string();

    handle.send_delta("Hi");
    let response = get(&state, &format!("/stream?stream_id={}", sid)).await;
    let mut body = response.into_body().into_data_stream();

    let mut seen = String::new();
    while !seen.contains("Hi") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("timed out waiting for first delta")
            .expect("stream ended early")
            .unwrap();
        seen.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    let response = post_json(&state, "/stop_stream", json!({ "stream_id": sid })).await;
    assert_eq!(response.status(), StatusCode::OK);
    handle.send_delta(" there");

    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("timed out waiting for end of stream")
    {
        seen.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
    }

    assert_eq!(sse_data(&seen), vec!["Hi", "[DONE]"]);
    assert_eq!(
        state.store.get(&cid).await.unwrap(),
        vec![Message::user("Hello"), Message::assistant("Hi")]
    );
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_new_conversation_survives_write_failure() {
    let (state, _tmp) = idle_state().await;
    std::fs::remove_dir_all(state.store.dir()).unwrap();
    std::fs::write(state.store.dir(), "not a directory").unwrap();

    let response = post_json(&state, "/new_conversation", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cid = body_json(response).await["conversation_id"]
        .as_str()
        .unwrap()
        .to_string();

    let listed = body_json(get(&state, "/list_conversations").await).await;
    assert_eq!(listed, json!([cid]));
    assert_eq!(state.store.get(&cid).await, Some(Vec::new()));
}
