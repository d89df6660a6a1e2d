use serde::{Deserialize, Serialize};

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Typed by the person at the chat client
    User,
    /// Generated by the upstream model
    Assistant,
}

/// One entry of a conversation
///
/// Serialized exactly as the upstream chat API expects a history item,
/// so a stored conversation can be sent upstream unchanged.
///
/// # Examples
///
/// ```
/// use chatrelay::storage::{Message, Role};
///
/// let msg = Message::user("Hello");
/// assert_eq!(msg.role, Role::User);
/// assert_eq!(
///     serde_json::to_string(&msg).unwrap(),
///     r#"{"role":"user","content":"Hello"}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who wrote the message
    pub role: Role,
    /// Message text
    pub content: String,
}

impl Message {
    /// Creates a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Creates a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Listing entry for a stored conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation identifier
    pub id: String,
    /// Number of messages in the conversation
    pub message_count: usize,
}
