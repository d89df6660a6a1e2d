//! Upstream completion sources
//!
//! A [`CompletionSource`] opens one streaming completion request and hands
//! back the raw response body as a [`LineStream`]. Concrete implementations:
//!
//! - [`client::UpstreamClient`] -- `reqwest` POST to an OpenAI-compatible
//!   chat completions endpoint.
//! - [`fake::ScriptedSource`] -- in-process source fed by a test.
//!
//! A line stream is lazy, finite, and cannot be restarted. It ends with
//! `None` when the remote side closes cleanly; a transport failure mid-body
//! is delivered as one final `Err` item so callers can tell the two apart.

use std::pin::Pin;

use futures::Stream;
use serde::Serialize;

use crate::error::Result;
use crate::storage::Message;

pub mod client;
pub mod fake;

pub use client::UpstreamClient;

/// Raw response lines, one item per `\n`-terminated line
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Sampling parameters sent with a completion request
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParams {
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling threshold
    pub top_p: f64,
    /// Maximum output tokens
    pub max_tokens: u32,
}

/// Abstraction over completion backends
///
/// Used polymorphically through `Arc<dyn CompletionSource>` by the relay.
#[async_trait::async_trait]
pub trait CompletionSource: Send + Sync + std::fmt::Debug {
    /// Open a streaming completion for `history`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RelayError::Upstream`] if the request cannot
    /// be sent or the endpoint answers with a non-success status.
    async fn open(&self, history: &[Message], params: &GenerationParams) -> Result<LineStream>;
}
