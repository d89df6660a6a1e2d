//! In-process completion source for tests
//!
//! [`ScriptedSource`] replaces the network with a channel. The test side
//! keeps a [`ScriptedHandle`] and pushes raw lines (or a transport failure)
//! one at a time, which makes it possible to interleave stop requests with
//! specific frames deterministically.
//!
//! ```text
//! handle.send_line() -> lines_tx -----> lines_rx (LineStream returned by open())
//! open(history, params) ------------> handle.requests()
//! ```
//!
//! # Example
//!
//! ```
//! use futures::StreamExt;
//! use chatrelay::storage::Message;
//! use chatrelay::upstream::fake::ScriptedSource;
//! use chatrelay::upstream::{CompletionSource, GenerationParams};
//!
//! # tokio_test::block_on(async {
//! let (source, handle) = ScriptedSource::new();
//! handle.send_line("data: [DONE]");
//! handle.finish();
//!
//! let params = GenerationParams { temperature: 0.1, top_p: 0.9, max_tokens: 100 };
//! let mut lines = source.open(&[Message::user("Hi")], &params).await.unwrap();
//! assert_eq!(lines.next().await.unwrap().unwrap(), "data: [DONE]");
//! assert!(lines.next().await.is_none());
//! assert_eq!(handle.requests()[0].history, vec![Message::user("Hi")]);
//! # });
//! ```

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Result, RelayError};
use crate::storage::Message;
use crate::upstream::{CompletionSource, GenerationParams, LineStream};

/// One scripted item of the upstream body
#[derive(Debug, Clone)]
enum ScriptedItem {
    Line(String),
    Fail(String),
}

/// What the relay asked the source for
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// History sent upstream
    pub history: Vec<Message>,
    /// Sampling parameters sent upstream
    pub params: GenerationParams,
}

/// Channel-backed [`CompletionSource`]
///
/// The first `open` takes the scripted body; later calls fail with an
/// upstream error, matching a real stream that cannot be restarted.
#[derive(Debug)]
pub struct ScriptedSource {
    lines_rx: Mutex<Option<mpsc::UnboundedReceiver<ScriptedItem>>>,
    open_error: Option<String>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

/// Test-side controller for a [`ScriptedSource`]
#[derive(Debug, Clone)]
pub struct ScriptedHandle {
    lines_tx: Arc<Mutex<Option<mpsc::UnboundedSender<ScriptedItem>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedSource {
    /// Create a source and its controlling handle
    pub fn new() -> (Self, ScriptedHandle) {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                lines_rx: Mutex::new(Some(lines_rx)),
                open_error: None,
                requests: Arc::clone(&requests),
            },
            ScriptedHandle {
                lines_tx: Arc::new(Mutex::new(Some(lines_tx))),
                requests,
            },
        )
    }

    /// A source whose body is exactly `lines`, followed by a clean close
    pub fn from_lines<I, S>(lines: I) -> (Self, ScriptedHandle)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (source, handle) = Self::new();
        for line in lines {
            handle.send_line(line);
        }
        handle.finish();
        (source, handle)
    }

    /// A source whose `open` fails with `message`, as for a refused connection
    pub fn failing(message: impl Into<String>) -> (Self, ScriptedHandle) {
        let (mut source, handle) = Self::new();
        source.open_error = Some(message.into());
        (source, handle)
    }
}

impl ScriptedHandle {
    /// Queue one raw body line
    pub fn send_line(&self, line: impl Into<String>) {
        self.push(ScriptedItem::Line(line.into()));
    }

    /// Queue an SSE `data:` line carrying one content delta
    pub fn send_delta(&self, text: &str) {
        let payload = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
        self.send_line(format!("data: {}", payload));
    }

    /// Queue a transport failure; the body ends after it
    pub fn fail(&self, message: impl Into<String>) {
        self.push(ScriptedItem::Fail(message.into()));
        self.finish();
    }

    /// Close the body cleanly
    pub fn finish(&self) {
        if let Ok(mut tx) = self.lines_tx.lock() {
            tx.take();
        }
    }

    /// Every request the source has been opened with
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn push(&self, item: ScriptedItem) {
        if let Ok(tx) = self.lines_tx.lock() {
            if let Some(tx) = tx.as_ref() {
                // The receiver is gone once the relay stops reading.
                let _ = tx.send(item);
            }
        }
    }
}

#[async_trait::async_trait]
impl CompletionSource for ScriptedSource {
    async fn open(&self, history: &[Message], params: &GenerationParams) -> Result<LineStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                history: history.to_vec(),
                params: *params,
            });
        }

        if let Some(message) = &self.open_error {
            return Err(RelayError::Upstream(message.clone()).into());
        }

        let rx = self
            .lines_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| RelayError::Upstream("scripted stream already opened".to_string()))?;

        let lines = UnboundedReceiverStream::new(rx).map(|item| match item {
            ScriptedItem::Line(line) => Ok(line),
            ScriptedItem::Fail(message) => Err(anyhow::Error::from(RelayError::Upstream(message))),
        });
        Ok(Box::pin(lines))
    }
}
