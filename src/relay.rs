//! Stream orchestrator
//!
//! Drives one stream session from start to a terminal outcome:
//!
//! ```text
//! Starting --> Streaming --> Completed | Cancelled | Failed
//!     \________________________________________/^
//! ```
//!
//! On start the session's parameters are looked up, the conversation history
//! is snapshotted, an empty assistant placeholder is appended, and the
//! upstream completion is opened. While streaming, the cancellation token is
//! polled once per received upstream line before the line is interpreted.
//! Each non-empty delta is appended to the placeholder, persisted, and
//! forwarded to the client as one [`ClientFrame`].
//!
//! Whatever the exit path, the session is retired from the registry before
//! [`Relay::run`] returns or its future is dropped.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::registry::StreamRegistry;
use crate::sse::{self, SseEvent};
use crate::storage::{ConversationStore, Message};
use crate::upstream::CompletionSource;

/// Frames the orchestrator keeps ahead of the client
const CLIENT_CHANNEL_CAPACITY: usize = 1;

/// One frame of the client-facing event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// A fragment of assistant text (unescaped)
    Delta(String),
    /// The stream ended, either completed or stopped
    Done,
    /// The stream failed
    Error(String),
}

impl ClientFrame {
    /// Text carried in the frame's `data:` field
    ///
    /// # Examples
    ///
    /// ```
    /// use chatrelay::relay::ClientFrame;
    ///
    /// assert_eq!(ClientFrame::Delta("<b>".into()).data(), "&lt;b&gt;");
    /// assert_eq!(ClientFrame::Done.data(), "[DONE]");
    /// assert_eq!(ClientFrame::Error("boom".into()).data(), "[Request failed: boom]");
    /// ```
    pub fn data(&self) -> String {
        match self {
            ClientFrame::Delta(text) => escape_markup(text),
            ClientFrame::Done => "[DONE]".to_string(),
            ClientFrame::Error(message) => format!("[Request failed: {}]", message),
        }
    }
}

/// Escape angle brackets so streamed text cannot inject markup
pub fn escape_markup(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

/// Terminal state of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Upstream finished, with or without the `[DONE]` sentinel
    Completed,
    /// Stopped by a stop request or by the client going away
    Cancelled,
    /// Unknown stream, upstream refused, or the body broke mid-stream
    Failed(String),
}

type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>;

/// Per-session data carried through the streaming state
struct ActiveStream {
    conversation_id: String,
    cancel: CancellationToken,
    events: EventStream,
    deltas: usize,
}

enum StreamState {
    Starting,
    Streaming(ActiveStream),
    Finished(StreamOutcome),
}

/// Retires a session when dropped
struct SessionGuard<'a> {
    registry: &'a StreamRegistry,
    stream_id: &'a str,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.retire(self.stream_id);
    }
}

/// Stream orchestrator shared by every stream connection
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use chatrelay::registry::{StreamParams, StreamRegistry};
/// use chatrelay::relay::{ClientFrame, Relay, StreamOutcome};
/// use chatrelay::storage::{ConversationStore, Message};
/// use chatrelay::upstream::fake::ScriptedSource;
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let store = Arc::new(ConversationStore::open(dir.path()).await.unwrap());
/// let cid = store.create().await.unwrap();
/// store.append(&cid, Message::user("Hello")).await.unwrap();
///
/// let registry = Arc::new(StreamRegistry::new());
/// let sid = registry.create(StreamParams {
///     conversation_id: cid.clone(),
///     temperature: 0.1,
///     top_p: 0.9,
///     max_tokens: 100,
/// });
///
/// let (source, handle) = ScriptedSource::new();
/// handle.send_delta("Hi there!");
/// handle.send_line("data: [DONE]");
///
/// let relay = Relay::new(store.clone(), registry.clone(), Arc::new(source));
/// let (tx, mut rx) = tokio::sync::mpsc::channel(8);
/// let outcome = relay.run(&sid, tx).await;
///
/// assert_eq!(outcome, StreamOutcome::Completed);
/// assert_eq!(rx.recv().await, Some(ClientFrame::Delta("Hi there!".into())));
/// assert_eq!(rx.recv().await, Some(ClientFrame::Done));
/// assert_eq!(store.get(&cid).await.unwrap()[1], Message::assistant("Hi there!"));
/// assert!(registry.is_empty());
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct Relay {
    store: Arc<ConversationStore>,
    registry: Arc<StreamRegistry>,
    upstream: Arc<dyn CompletionSource>,
}

impl Relay {
    /// Create a relay over shared services
    pub fn new(
        store: Arc<ConversationStore>,
        registry: Arc<StreamRegistry>,
        upstream: Arc<dyn CompletionSource>,
    ) -> Self {
        Self {
            store,
            registry,
            upstream,
        }
    }

    /// Run a stream on its own task
    ///
    /// Frames arrive on the returned stream through a channel of capacity one,
    /// so the orchestrator never runs more than one frame ahead of the
    /// client. Dropping the stream ends the session as cancelled at the next
    /// frame it tries to deliver.
    pub fn spawn(
        self: &Arc<Self>,
        stream_id: String,
    ) -> (ReceiverStream<ClientFrame>, JoinHandle<StreamOutcome>) {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let relay = Arc::clone(self);
        let task = tokio::spawn(async move { relay.run(&stream_id, tx).await });
        (ReceiverStream::new(rx), task)
    }

    /// Drive one stream session to its terminal outcome
    pub async fn run(&self, stream_id: &str, sink: mpsc::Sender<ClientFrame>) -> StreamOutcome {
        let _guard = SessionGuard {
            registry: &self.registry,
            stream_id,
        };

        let mut state = StreamState::Starting;
        loop {
            state = match state {
                StreamState::Starting => self.start(stream_id, &sink).await,
                StreamState::Streaming(active) => self.step(active, &sink).await,
                StreamState::Finished(outcome) => {
                    info!(stream_id = %stream_id, outcome = ?outcome, "Stream finished");
                    return outcome;
                }
            };
        }
    }

    async fn start(&self, stream_id: &str, sink: &mpsc::Sender<ClientFrame>) -> StreamState {
        let Some(session) = self.registry.claim(stream_id) else {
            warn!(stream_id = %stream_id, "Stream requested for unknown id");
            let err = RelayError::UnknownStream(stream_id.to_string());
            return fail(sink, err.to_string()).await;
        };
        let conversation_id = session.params.conversation_id.clone();

        let Some(history) = self.store.get(&conversation_id).await else {
            warn!(
                stream_id = %stream_id,
                conversation_id = %conversation_id,
                "Conversation vanished before streaming started"
            );
            return fail(sink, "invalid conversation_id".to_string()).await;
        };

        if let Err(e) = self
            .store
            .append(&conversation_id, Message::assistant(""))
            .await
        {
            warn!(conversation_id = %conversation_id, "Failed to persist placeholder: {:#}", e);
        }

        info!(
            stream_id = %stream_id,
            conversation_id = %conversation_id,
            history = history.len(),
            "Starting upstream stream"
        );

        match self
            .upstream
            .open(&history, &session.params.generation())
            .await
        {
            Ok(lines) => StreamState::Streaming(ActiveStream {
                conversation_id,
                cancel: session.cancel,
                events: Box::pin(sse::frames(lines)),
                deltas: 0,
            }),
            Err(e) => {
                warn!(stream_id = %stream_id, "Upstream open failed: {:#}", e);
                fail(sink, format!("{:#}", e)).await
            }
        }
    }

    async fn step(&self, mut active: ActiveStream, sink: &mpsc::Sender<ClientFrame>) -> StreamState {
        let event = match active.events.next().await {
            None => {
                debug!(deltas = active.deltas, "Upstream closed without [DONE]");
                return finish(sink, ClientFrame::Done, StreamOutcome::Completed).await;
            }
            Some(Err(e)) => {
                warn!(
                    conversation_id = %active.conversation_id,
                    deltas = active.deltas,
                    "Upstream stream failed: {:#}",
                    e
                );
                return fail(sink, format!("{:#}", e)).await;
            }
            Some(Ok(event)) => event,
        };

        if active.cancel.is_cancelled() {
            debug!(deltas = active.deltas, "Stop flag observed");
            return finish(sink, ClientFrame::Done, StreamOutcome::Cancelled).await;
        }

        match event {
            SseEvent::Done => finish(sink, ClientFrame::Done, StreamOutcome::Completed).await,
            SseEvent::Skip => StreamState::Streaming(active),
            // Empty deltas are neither persisted nor forwarded.
            SseEvent::Delta(text) if text.is_empty() => StreamState::Streaming(active),
            SseEvent::Delta(text) => {
                self.persist_delta(&active.conversation_id, &text).await;
                active.deltas += 1;
                if sink.send(ClientFrame::Delta(text)).await.is_err() {
                    debug!(deltas = active.deltas, "Client went away");
                    return StreamState::Finished(StreamOutcome::Cancelled);
                }
                StreamState::Streaming(active)
            }
        }
    }

    async fn persist_delta(&self, conversation_id: &str, text: &str) {
        match self.store.append_to_trailing(conversation_id, text).await {
            Ok(true) => {}
            Ok(false) => debug!(
                conversation_id = %conversation_id,
                "Conversation no longer accepts deltas; forwarding only"
            ),
            Err(e) => warn!(
                conversation_id = %conversation_id,
                "Failed to persist delta: {:#}",
                e
            ),
        }
    }
}

async fn finish(
    sink: &mpsc::Sender<ClientFrame>,
    frame: ClientFrame,
    outcome: StreamOutcome,
) -> StreamState {
    // A client that already hung up does not change the outcome.
    let _ = sink.send(frame).await;
    StreamState::Finished(outcome)
}

async fn fail(sink: &mpsc::Sender<ClientFrame>, message: String) -> StreamState {
    finish(
        sink,
        ClientFrame::Error(message.clone()),
        StreamOutcome::Failed(message),
    )
    .await
}
