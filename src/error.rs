//! Error types for ChatRelay
//!
//! This module defines all error types used throughout the relay,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for ChatRelay operations
///
/// Covers configuration loading, credential resolution, upstream
/// completion requests, conversation persistence, and request validation
/// at the HTTP boundary.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No API key could be resolved for the upstream completion endpoint
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// Upstream transport failures (connect, TLS, non-2xx status, body read)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Conversation storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stream identifier that the registry does not know about
    #[error("invalid stream_id")]
    UnknownStream(String),

    /// Malformed client request (bad ids, bad numeric fields, bad indices)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for ChatRelay operations
///
/// Uses `anyhow::Error` so that callers can attach context while still
/// being able to downcast to [`RelayError`] where the variant matters.
pub type Result<T> = anyhow::Result<T>;
