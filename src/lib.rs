//! ChatRelay - streaming relay between a web chat client and an LLM API
//!
//! This library provides the pieces of the relay: conversation persistence,
//! the stream session registry, the upstream completion client, parsing of
//! upstream event-stream frames, and the orchestrator that ties them
//! together behind an HTTP surface.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `storage`: Conversation store mirrored to one JSON file per conversation
//! - `registry`: Stream sessions and their cancellation flags
//! - `upstream`: Completion sources (HTTP client and an in-process fake)
//! - `sse`: Upstream line to frame parsing
//! - `relay`: The stream orchestrator
//! - `server`: axum routes and handlers
//! - `config`: Configuration management and validation
//! - `credentials`: API key resolution
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use chatrelay::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     chatrelay::commands::serve::run_serve(config).await
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod sse;
pub mod storage;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
pub use registry::{StreamParams, StreamRegistry};
pub use relay::{ClientFrame, Relay, StreamOutcome};
pub use storage::{ConversationStore, Message, Role};
