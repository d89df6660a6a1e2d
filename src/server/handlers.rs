//! Route handlers

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::error::RelayError;
use crate::registry::StreamParams;
use crate::relay::ClientFrame;
use crate::storage::Message;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of `/send_message`
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// User message text
    #[serde(default)]
    pub text: Option<String>,
    /// Target conversation
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Overrides the configured temperature
    #[serde(default, deserialize_with = "lenient::float")]
    pub temperature: Option<f64>,
    /// Overrides the configured top_p
    #[serde(default, deserialize_with = "lenient::float")]
    pub top_p: Option<f64>,
    /// Overrides the configured max_tokens
    #[serde(default, deserialize_with = "lenient::integer")]
    pub max_tokens: Option<i64>,
}

/// Body of routes that name one conversation
#[derive(Debug, Deserialize)]
pub struct ConversationRequest {
    /// Conversation id
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Body of `/delete_pair`
#[derive(Debug, Deserialize)]
pub struct DeletePairRequest {
    /// Conversation id
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Index of the message that starts the pair
    #[serde(default, deserialize_with = "lenient::integer")]
    pub pair_index: Option<i64>,
}

/// Body of `/stop_stream`
#[derive(Debug, Deserialize)]
pub struct StopStreamRequest {
    /// Stream to stop
    #[serde(default)]
    pub stream_id: Option<String>,
}

/// Query of `/conversation_history`
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Conversation id
    pub conversation_id: Option<String>,
}

/// Query of `/stream`
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Stream id returned by `/send_message`
    pub stream_id: Option<String>,
}

/// `POST /new_conversation`
pub async fn new_conversation(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let id = state.store.create().await?;
    info!(conversation_id = %id, "Created conversation");
    Ok(Json(json!({ "conversation_id": id })))
}

/// `GET /list_conversations`
pub async fn list_conversations(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.list_ids().await)
}

/// `GET /conversation_history?conversation_id=`
///
/// Unknown ids yield an empty list.
pub async fn conversation_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<Message>> {
    let id = query.conversation_id.unwrap_or_default();
    Json(state.store.get(&id).await.unwrap_or_default())
}

/// `POST /send_message`
///
/// Appends the user message and registers a stream session; the reply is
/// produced when the client opens `/stream` with the returned id.
pub async fn send_message(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let conversation_id = request.conversation_id.unwrap_or_default();
    if !state.store.contains(&conversation_id).await {
        return Err(ApiError::bad_request("Invalid conversation_id"));
    }
    let text = request
        .text
        .ok_or_else(|| ApiError::bad_request("Missing text"))?;

    let max_tokens = match request.max_tokens {
        Some(n) => u32::try_from(n).map_err(|_| ApiError::bad_request("Invalid max_tokens"))?,
        None => state.generation.max_tokens,
    };
    let params = StreamParams {
        conversation_id: conversation_id.clone(),
        temperature: request.temperature.unwrap_or(state.generation.temperature),
        top_p: request.top_p.unwrap_or(state.generation.top_p),
        max_tokens,
    };

    match state.store.append(&conversation_id, Message::user(text)).await {
        Ok(true) => {}
        Ok(false) => return Err(ApiError::bad_request("Invalid conversation_id")),
        Err(e) => warn!(conversation_id = %conversation_id, "Failed to persist user message: {:#}", e),
    }

    let stream_id = state.registry.create(params);
    info!(
        conversation_id = %conversation_id,
        stream_id = %stream_id,
        "Accepted message"
    );
    Ok(Json(json!({ "stream_id": stream_id })))
}

/// `GET /stream?stream_id=`
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream_id = query.stream_id.unwrap_or_default();
    let (frames, _task) = state.relay.spawn(stream_id);
    Sse::new(frames.map(|frame| Ok(frame_event(&frame))))
}

/// `POST /stop_stream`
///
/// Always succeeds; unknown or finished streams are ignored.
pub async fn stop_stream(
    State(state): State<AppState>,
    payload: std::result::Result<Json<StopStreamRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let stream_id = request.stream_id.unwrap_or_default();
    state.registry.request_cancel(&stream_id);
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Stop request for {}", stream_id),
    })))
}

/// `POST /delete_conversation`
pub async fn delete_conversation(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ConversationRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let id = request.conversation_id.unwrap_or_default();
    if !state.store.delete(&id).await? {
        return Err(ApiError::rejected("Invalid conversation_id"));
    }
    info!(conversation_id = %id, "Deleted conversation");
    Ok(Json(json!({
        "status": "ok",
        "message": format!("Conversation {} deleted", id),
    })))
}

/// `POST /delete_pair`
pub async fn delete_pair(
    State(state): State<AppState>,
    payload: std::result::Result<Json<DeletePairRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let id = request.conversation_id.unwrap_or_default();
    // Missing and negative indices fall through to the store's range check.
    let index = request
        .pair_index
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(usize::MAX);

    state.store.delete_pair(&id, index).await?;
    info!(conversation_id = %id, pair_index = index, "Deleted message pair");
    Ok(Json(json!({ "status": "ok" })))
}

/// `POST /debug_print`
///
/// Logs the conversation exactly as it is stored on disk.
pub async fn debug_print(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ConversationRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    let id = request.conversation_id.unwrap_or_default();
    let not_found = || ApiError::bad_request(format!("File not found for conversation_id: {}", id));

    let messages = match state.store.read_persisted(&id).await {
        Ok(Some(messages)) => messages,
        Ok(None) => return Err(not_found()),
        Err(e) if matches!(e.downcast_ref::<RelayError>(), Some(RelayError::InvalidRequest(_))) => {
            return Err(not_found())
        }
        Err(e) => {
            return Err(ApiError::internal(format!(
                "Could not load file for conversation_id {}: {:#}",
                id, e
            )))
        }
    };

    let path = state.store.file_path(&id)?;
    let pretty = serde_json::to_string_pretty(&messages)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!("Contents of {}:\n{}", path.display(), pretty);

    Ok(Json(json!({
        "status": "ok",
        "message": format!("Printed contents of {} to server logs", path.display()),
    })))
}

/// Encode a frame for the SSE writer
///
/// The writer splits `data` on `\n` into several `data:` lines, which the
/// browser joins back together; a bare `\r` would otherwise be rejected.
fn frame_event(frame: &ClientFrame) -> Event {
    let data = frame.data().replace("\r\n", "\n").replace('\r', "\n");
    Event::default().data(data)
}

/// Deserializers for numeric fields that browsers sometimes send as strings
mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(serde_json::Number),
        Text(String),
    }

    pub fn float<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrText::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("number out of range: {}", n))),
            Some(NumberOrText::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("not a number: {:?}", s))),
        }
    }

    /// Fractional JSON numbers are truncated; strings must hold an integer.
    pub fn integer<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            None => Ok(None),
            Some(NumberOrText::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("integer out of range: {}", n))),
            Some(NumberOrText::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("not an integer: {:?}", s))),
        }
    }
}
