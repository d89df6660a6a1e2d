use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatrelay::config::{GenerationConfig, UpstreamConfig};
use chatrelay::registry::StreamRegistry;
use chatrelay::server::{self, AppState};
use chatrelay::storage::ConversationStore;
use chatrelay::upstream::{CompletionSource, UpstreamClient};

pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Upstream configuration pointing at a wiremock server
#[allow(dead_code)]
pub fn upstream_config(server: &MockServer) -> UpstreamConfig {
    UpstreamConfig {
        api_url: format!("{}{}", server.uri(), COMPLETIONS_PATH),
        ..UpstreamConfig::default()
    }
}

/// An event-stream body carrying `deltas`, optionally ended by `[DONE]`
#[allow(dead_code)]
pub fn sse_body(deltas: &[&str], done: bool) -> String {
    let mut body = String::new();
    for delta in deltas {
        let chunk = serde_json::json!({ "choices": [{ "delta": { "content": delta } }] });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

/// Serve `body` as `text/event-stream` for every completion request
#[allow(dead_code)]
pub async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream"))
        .mount(server)
        .await;
}

#[allow(dead_code)]
pub async fn temp_store() -> (Arc<ConversationStore>, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let store = ConversationStore::open(tmp.path())
        .await
        .expect("failed to open store");
    (Arc::new(store), tmp)
}

/// App state over a temp store and the given completion source
#[allow(dead_code)]
pub async fn app_state(upstream: Arc<dyn CompletionSource>) -> (AppState, TempDir) {
    let (store, tmp) = temp_store().await;
    let state = AppState::new(
        store,
        Arc::new(StreamRegistry::new()),
        upstream,
        GenerationConfig::default(),
    );
    (state, tmp)
}

/// App state whose upstream is a real HTTP client aimed at `server`
#[allow(dead_code)]
pub async fn app_state_for(server: &MockServer) -> (AppState, TempDir) {
    let client = UpstreamClient::new(&upstream_config(server), "sk-test".to_string())
        .expect("failed to build upstream client");
    app_state(Arc::new(client)).await
}

#[allow(dead_code)]
pub async fn post_json(state: &AppState, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid request");
    server::router(state.clone())
        .oneshot(request)
        .await
        .expect("router is infallible")
}

#[allow(dead_code)]
pub async fn get(state: &AppState, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("valid request");
    server::router(state.clone())
        .oneshot(request)
        .await
        .expect("router is infallible")
}

#[allow(dead_code)]
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

#[allow(dead_code)]
pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    String::from_utf8(bytes.to_vec()).expect("body is not UTF-8")
}

/// `data` payloads of every event in an event-stream body, the way a
/// browser's `EventSource` would deliver them
#[allow(dead_code)]
pub fn sse_data(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|event| !event.trim().is_empty())
        .map(|event| {
            event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}

/// Create a conversation through the API and return its id
#[allow(dead_code)]
pub async fn new_conversation(state: &AppState) -> String {
    let response = post_json(state, "/new_conversation", serde_json::json!({})).await;
    body_json(response).await["conversation_id"]
        .as_str()
        .expect("conversation_id missing")
        .to_string()
}
