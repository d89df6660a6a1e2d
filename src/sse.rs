//! Upstream event-stream frame parsing
//!
//! Turns raw upstream lines into [`SseEvent`]s, one event per line:
//!
//! - blank line -- [`SseEvent::Skip`] (keep-alive / frame separator)
//! - `data: [DONE]` -- [`SseEvent::Done`]
//! - `data: {json}` -- [`SseEvent::Delta`] with `choices[0].delta.content`,
//!   or an empty delta when any level is absent
//! - `data:` payload that is not a well-formed chunk -- [`SseEvent::Skip`];
//!   a single bad frame never ends the stream
//! - any other line (`event:`, `id:`, `:` comments) -- [`SseEvent::Skip`]

use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::Result;
use crate::upstream::LineStream;

/// Prefix of an SSE data line
pub const DATA_PREFIX: &str = "data: ";

/// Line that ends an upstream completion stream
pub const DONE_SENTINEL: &str = "data: [DONE]";

/// Meaning of one upstream line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Next fragment of generated text
    ///
    /// May be empty; the relay drops empty fragments without persisting or
    /// forwarding them.
    Delta(String),
    /// Upstream signalled a clean end of stream
    Done,
    /// Nothing to act on for this line
    Skip,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Classify a single upstream line
///
/// # Examples
///
/// ```
/// use chatrelay::sse::{parse_line, SseEvent};
///
/// let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
/// assert_eq!(parse_line(line), SseEvent::Delta("Hi".to_string()));
/// assert_eq!(parse_line("data: [DONE]"), SseEvent::Done);
/// assert_eq!(parse_line(""), SseEvent::Skip);
/// assert_eq!(parse_line("data: {oops"), SseEvent::Skip);
/// ```
pub fn parse_line(line: &str) -> SseEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return SseEvent::Skip;
    }
    if trimmed == DONE_SENTINEL {
        return SseEvent::Done;
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return SseEvent::Skip;
    };

    match serde_json::from_str::<ChunkPayload>(payload) {
        Ok(chunk) => SseEvent::Delta(
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .and_then(|d| d.content)
                .unwrap_or_default(),
        ),
        Err(e) => {
            tracing::debug!("Dropping malformed upstream frame: {}", e);
            SseEvent::Skip
        }
    }
}

/// Map a raw line stream to parsed events, passing transport errors through
pub fn frames(lines: LineStream) -> impl Stream<Item = Result<SseEvent>> + Send {
    lines.map(|line| line.map(|l| parse_line(&l)))
}
