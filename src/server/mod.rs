//! HTTP surface of the relay
//!
//! Routes mirror what the chat page calls: conversation management, message
//! submission, the event stream itself, and the stop button. Handlers live
//! in [`handlers`]; this module owns shared state, routing and the error
//! response shape.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use crate::config::{GenerationConfig, ServerConfig};
use crate::error::{RelayError, Result};
use crate::registry::StreamRegistry;
use crate::relay::Relay;
use crate::storage::ConversationStore;
use crate::upstream::CompletionSource;

pub mod handlers;

/// Services shared by every request
#[derive(Debug, Clone)]
pub struct AppState {
    /// Conversation persistence
    pub store: Arc<ConversationStore>,
    /// Live stream sessions
    pub registry: Arc<StreamRegistry>,
    /// Orchestrator used by `/stream`
    pub relay: Arc<Relay>,
    /// Defaults for parameters a client leaves out
    pub generation: GenerationConfig,
}

impl AppState {
    /// Wire the shared services together
    pub fn new(
        store: Arc<ConversationStore>,
        registry: Arc<StreamRegistry>,
        upstream: Arc<dyn CompletionSource>,
        generation: GenerationConfig,
    ) -> Self {
        let relay = Arc::new(Relay::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            upstream,
        ));
        Self {
            store,
            registry,
            relay,
            generation,
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/new_conversation", post(handlers::new_conversation))
        .route("/list_conversations", get(handlers::list_conversations))
        .route("/conversation_history", get(handlers::conversation_history))
        .route("/send_message", post(handlers::send_message))
        .route("/stream", get(handlers::stream))
        .route("/stop_stream", post(handlers::stop_stream))
        .route("/delete_conversation", post(handlers::delete_conversation))
        .route("/delete_pair", post(handlers::delete_pair))
        .route("/debug_print", post(handlers::debug_print))
        .with_state(state)
}

/// Bind and serve until the process is stopped
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Config(format!("Failed to bind {}: {}", addr, e)))?;

    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Body layout of an error response
///
/// The chat page reads `error` from some routes and `status`/`message` from
/// others, so both layouts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorShape {
    /// `{"error": "..."}`
    Error,
    /// `{"status": "error", "message": "..."}`
    Status,
}

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    shape: ErrorShape,
    message: String,
}

impl ApiError {
    /// 400 with an `{"error": ...}` body
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            shape: ErrorShape::Error,
            message: message.into(),
        }
    }

    /// 400 with a `{"status": "error", "message": ...}` body
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            shape: ErrorShape::Status,
            message: message.into(),
        }
    }

    /// 500 with an `{"error": ...}` body
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            shape: ErrorShape::Error,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.shape {
            ErrorShape::Error => serde_json::json!({ "error": self.message }),
            ErrorShape::Status => serde_json::json!({ "status": "error", "message": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<RelayError>() {
            Some(RelayError::InvalidRequest(message)) => Self::rejected(message.clone()),
            _ => {
                tracing::error!("Request failed: {:#}", err);
                Self::internal(format!("{:#}", err))
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}
