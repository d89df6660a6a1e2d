//! Stream session registry
//!
//! Maps each issued stream id to the generation parameters captured when the
//! client sent its message, plus a cancellation token. Stop requests flip the
//! token; the relay polls it once per upstream line.
//!
//! A session is claimed when its `/stream` request starts. Sessions that are
//! never claimed are removed by [`StreamRegistry::sweep_unclaimed`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::upstream::GenerationParams;

/// Generation parameters and target conversation for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    /// Conversation the assistant reply is written into
    pub conversation_id: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling threshold
    pub top_p: f64,
    /// Maximum output tokens
    pub max_tokens: u32,
}

impl StreamParams {
    /// Sampling parameters to send upstream
    pub fn generation(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        }
    }
}

/// Live registry record for one stream
#[derive(Debug, Clone)]
pub struct StreamSession {
    /// Parameters captured at creation
    pub params: StreamParams,
    /// Cancelled by [`StreamRegistry::request_cancel`]
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct Entry {
    session: StreamSession,
    created: Instant,
    claimed: bool,
}

/// Process-wide table of stream sessions
///
/// Every method takes the lock for a single map operation only, so the
/// registry never becomes a point of contention between streams.
///
/// # Examples
///
/// ```
/// use chatrelay::registry::{StreamParams, StreamRegistry};
///
/// let registry = StreamRegistry::new();
/// let id = registry.create(StreamParams {
///     conversation_id: "c1".to_string(),
///     temperature: 0.1,
///     top_p: 0.9,
///     max_tokens: 100,
/// });
///
/// registry.request_cancel(&id);
/// assert!(registry.is_cancelled(&id));
///
/// registry.retire(&id);
/// assert!(!registry.is_cancelled(&id));
/// ```
#[derive(Debug, Default)]
pub struct StreamRegistry {
    sessions: Mutex<HashMap<String, Entry>>,
}

impl StreamRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its fresh id
    pub fn create(&self, params: StreamParams) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            stream_id = %id,
            conversation_id = %params.conversation_id,
            "Registered stream session"
        );
        self.lock().insert(
            id.clone(),
            Entry {
                session: StreamSession {
                    params,
                    cancel: CancellationToken::new(),
                },
                created: Instant::now(),
                claimed: false,
            },
        );
        id
    }

    /// Flag a session for cancellation; unknown ids are ignored
    pub fn request_cancel(&self, stream_id: &str) {
        match self.lock().get(stream_id) {
            Some(entry) => {
                entry.session.cancel.cancel();
                tracing::info!(stream_id = %stream_id, "Stop requested");
            }
            None => tracing::debug!(stream_id = %stream_id, "Stop requested for inactive stream"),
        }
    }

    /// Whether the session exists and has been flagged for cancellation
    pub fn is_cancelled(&self, stream_id: &str) -> bool {
        self.lock()
            .get(stream_id)
            .is_some_and(|e| e.session.cancel.is_cancelled())
    }

    /// Clone of a live session record
    pub fn session(&self, stream_id: &str) -> Option<StreamSession> {
        self.lock().get(stream_id).map(|e| e.session.clone())
    }

    /// Mark a session as picked up by its stream and return it
    ///
    /// Claimed sessions are exempt from [`StreamRegistry::sweep_unclaimed`].
    pub fn claim(&self, stream_id: &str) -> Option<StreamSession> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(stream_id)?;
        entry.claimed = true;
        Some(entry.session.clone())
    }

    /// Parameters of a live session
    pub fn params(&self, stream_id: &str) -> Option<StreamParams> {
        self.lock().get(stream_id).map(|e| e.session.params.clone())
    }

    /// Remove a session; absent ids are ignored
    ///
    /// # Returns
    ///
    /// `true` if a session was removed
    pub fn retire(&self, stream_id: &str) -> bool {
        let removed = self.lock().remove(stream_id).is_some();
        if removed {
            tracing::debug!(stream_id = %stream_id, "Retired stream session");
        }
        removed
    }

    /// Remove unclaimed sessions created at least `max_age` ago
    ///
    /// # Returns
    ///
    /// Number of sessions removed
    pub fn sweep_unclaimed(&self, max_age: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let stale = !entry.claimed && entry.created.elapsed() >= max_age;
            if stale {
                tracing::debug!(stream_id = %id, "Discarding unclaimed stream session");
            }
            !stale
        });
        before - sessions.len()
    }

    /// Run [`StreamRegistry::sweep_unclaimed`] every `max_age` until the
    /// runtime shuts down
    ///
    /// # Panics
    ///
    /// Panics if `max_age` is zero
    pub fn spawn_sweeper(self: &Arc<Self>, max_age: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_age);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = registry.sweep_unclaimed(max_age);
                if removed > 0 {
                    tracing::info!(removed, "Discarded unclaimed stream sessions");
                }
            }
        })
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave a half-applied map
        // operation behind, so a poisoned lock is still consistent.
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
