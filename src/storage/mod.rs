//! Conversation persistence
//!
//! Keeps every conversation in memory and mirrors each one to
//! `<dir>/<id>.json` after every mutation. The id table sits behind one
//! `RwLock` that is only held long enough to look up an entry; each
//! conversation then has its own `Mutex`, held across both the mutation and
//! the file write, so concurrent readers never observe a half-applied change
//! and writes to one file land in mutation order.

use crate::error::{Result, RelayError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub mod types;
pub use types::{ConversationSummary, Message, Role};

#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<Message>,
    /// Set once the conversation is deleted; later writers holding an old
    /// handle must not recreate its file.
    deleted: bool,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    conversation: Arc<Mutex<Conversation>>,
}

/// JSON-directory backed conversation store
///
/// Mutating methods apply the change in memory first and then rewrite the
/// conversation's file. When that write fails the in-memory change is kept
/// and the error is returned so the caller can decide whether to log it.
#[derive(Debug)]
pub struct ConversationStore {
    dir: PathBuf,
    conversations: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
}

impl ConversationStore {
    /// Open a store rooted at `dir`, creating the directory and loading every
    /// conversation file already in it.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Storage` if the directory cannot be created or
    /// listed. Individual unreadable files are logged and skipped.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chatrelay::storage::ConversationStore;
    ///
    /// # async fn example() -> chatrelay::error::Result<()> {
    /// let store = ConversationStore::open("conversations").await?;
    /// let id = store.create().await?;
    /// assert!(store.get(&id).await.unwrap().is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            RelayError::Storage(format!(
                "Failed to create conversations directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let store = Self {
            dir,
            conversations: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        };
        let loaded = store.load_all().await?;
        tracing::info!(
            "Loaded {} conversation(s) from {}",
            loaded,
            store.dir.display()
        );
        Ok(store)
    }

    /// Directory backing this store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every `*.json` file in the store directory into memory.
    ///
    /// Files are visited in file-name order, which becomes their listing
    /// order. Conversations already in memory are replaced.
    ///
    /// # Returns
    ///
    /// The number of conversations loaded
    pub async fn load_all(&self) -> Result<usize> {
        let mut reader = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            RelayError::Storage(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| RelayError::Storage(format!("Failed to list directory: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_id(id) {
                tracing::warn!("Skipping {}: not a conversation id", path.display());
                continue;
            }

            match read_messages(&path).await {
                Ok(messages) => {
                    self.insert(id.to_string(), messages).await;
                    loaded += 1;
                }
                Err(e) => tracing::warn!("Could not load {}: {}", path.display(), e),
            }
        }

        Ok(loaded)
    }

    /// Create an empty conversation and persist it
    ///
    /// A failed write is logged and the conversation stays live in memory,
    /// like every other mutation; the next successful write creates its file.
    ///
    /// # Returns
    ///
    /// The new conversation id
    pub async fn create(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = self.insert(id.clone(), Vec::new()).await;
        let guard = conversation.lock().await;
        if let Err(e) = self.persist(&id, &guard.messages).await {
            tracing::warn!(conversation_id = %id, "Failed to persist new conversation: {:#}", e);
        }
        Ok(id)
    }

    /// Snapshot of a conversation's messages, or `None` if it does not exist
    pub async fn get(&self, id: &str) -> Option<Vec<Message>> {
        let conversation = self.handle(id).await?;
        let guard = conversation.lock().await;
        if guard.deleted {
            return None;
        }
        Some(guard.messages.clone())
    }

    /// Whether a conversation with this id exists
    pub async fn contains(&self, id: &str) -> bool {
        self.conversations.read().await.contains_key(id)
    }

    /// Append a message and persist
    ///
    /// # Returns
    ///
    /// `false` when the conversation does not exist (nothing is written)
    pub async fn append(&self, id: &str, message: Message) -> Result<bool> {
        self.mutate(id, |messages| {
            messages.push(message);
            true
        })
        .await
    }

    /// Concatenate `delta` onto the trailing assistant message and persist
    ///
    /// # Returns
    ///
    /// `false` when the conversation does not exist or does not end with an
    /// assistant message
    pub async fn append_to_trailing(&self, id: &str, delta: &str) -> Result<bool> {
        self.mutate(id, |messages| match messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content.push_str(delta);
                true
            }
            _ => false,
        })
        .await
    }

    /// Replace the content of the trailing assistant message and persist
    ///
    /// # Returns
    ///
    /// `false` when the conversation does not exist or does not end with an
    /// assistant message
    pub async fn overwrite_trailing(&self, id: &str, text: &str) -> Result<bool> {
        self.mutate(id, |messages| match messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = text.to_string();
                true
            }
            _ => false,
        })
        .await
    }

    /// Remove the message at `index` and, when the message that slides into
    /// its place is an assistant reply, that reply as well.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidRequest` for an unknown conversation or an
    /// out-of-range index, or a storage error if the rewrite fails.
    pub async fn delete_pair(&self, id: &str, index: usize) -> Result<()> {
        let conversation = self
            .handle(id)
            .await
            .ok_or_else(|| RelayError::InvalidRequest("Unknown conversation".to_string()))?;

        let mut guard = conversation.lock().await;
        if guard.deleted {
            return Err(RelayError::InvalidRequest("Unknown conversation".to_string()).into());
        }
        if index >= guard.messages.len() {
            return Err(RelayError::InvalidRequest("Invalid pair_index".to_string()).into());
        }

        guard.messages.remove(index);
        if guard
            .messages
            .get(index)
            .is_some_and(|m| m.role == Role::Assistant)
        {
            guard.messages.remove(index);
        }

        self.persist(id, &guard.messages).await
    }

    /// Delete a conversation from memory and disk
    ///
    /// # Returns
    ///
    /// `false` when no such conversation exists
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let entry = self.conversations.write().await.remove(id);
        let Some(entry) = entry else {
            return Ok(false);
        };

        let mut guard = entry.conversation.lock().await;
        guard.deleted = true;
        guard.messages.clear();

        let path = self.file_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RelayError::Storage(format!(
                    "Failed to remove {}: {}",
                    path.display(),
                    e
                ))
                .into())
            }
        }

        Ok(true)
    }

    /// All conversation ids in creation (or load) order
    pub async fn list_ids(&self) -> Vec<String> {
        let table = self.conversations.read().await;
        let mut entries: Vec<(&String, u64)> = table.iter().map(|(id, e)| (id, e.seq)).collect();
        entries.sort_by_key(|(_, seq)| *seq);
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Id and message count for every conversation, in listing order
    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        let mut summaries = Vec::new();
        for id in self.list_ids().await {
            if let Some(messages) = self.get(&id).await {
                summaries.push(ConversationSummary {
                    id,
                    message_count: messages.len(),
                });
            }
        }
        summaries
    }

    /// Read a conversation straight from its file, bypassing memory
    ///
    /// # Returns
    ///
    /// `None` when no file exists for the id
    ///
    /// # Errors
    ///
    /// Returns an error for ids that cannot name a file, or for files that
    /// cannot be read or parsed
    pub async fn read_persisted(&self, id: &str) -> Result<Option<Vec<Message>>> {
        let path = self.file_path(id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        read_messages(&path).await.map(Some)
    }

    async fn handle(&self, id: &str) -> Option<Arc<Mutex<Conversation>>> {
        self.conversations
            .read()
            .await
            .get(id)
            .map(|e| Arc::clone(&e.conversation))
    }

    async fn insert(&self, id: String, messages: Vec<Message>) -> Arc<Mutex<Conversation>> {
        let conversation = Arc::new(Mutex::new(Conversation {
            messages,
            deleted: false,
        }));
        let entry = Entry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            conversation: Arc::clone(&conversation),
        };
        self.conversations.write().await.insert(id, entry);
        conversation
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<Message>) -> bool,
    {
        let Some(conversation) = self.handle(id).await else {
            return Ok(false);
        };

        let mut guard = conversation.lock().await;
        if guard.deleted || !apply(&mut guard.messages) {
            return Ok(false);
        }

        self.persist(id, &guard.messages).await?;
        Ok(true)
    }

    /// Write the full message list to a temp file, then rename it over the
    /// conversation file.
    async fn persist(&self, id: &str, messages: &[Message]) -> Result<()> {
        let path = self.file_path(id)?;
        let tmp = path.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(messages)
            .map_err(|e| RelayError::Storage(format!("Serialization failed: {}", e)))?;

        tokio::fs::write(&tmp, body).await.map_err(|e| {
            RelayError::Storage(format!("Could not save {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            RelayError::Storage(format!("Could not save {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    /// Path of the file backing conversation `id`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidRequest` for ids outside `[A-Za-z0-9_-]`
    pub fn file_path(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(RelayError::InvalidRequest(format!("Invalid conversation_id: {}", id)).into());
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

/// Ids double as file names, so only a conservative character set is allowed.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn read_messages(path: &Path) -> Result<Vec<Message>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| RelayError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        RelayError::Storage(format!("Failed to parse {}: {}", path.display(), e)).into()
    })
}
