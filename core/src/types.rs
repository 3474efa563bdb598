/// Shared types for the chat layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery status of a message. Ordered: `Sent < Delivered < Read`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// True when moving to `next` is a forward transition
    pub fn is_advanced_by(self, next: MessageStatus) -> bool {
        next > self
    }
}

/// Kind of message payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    #[serde(other)]
    Other,
}

/// A chat message as acknowledged by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

/// A user the signed-in user may chat with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    pub id: String,
    pub name: String,
    /// Portal role ("teacher", "parent", "admin", ...)
    #[serde(default)]
    pub role: Option<String>,
}

/// One conversation thread (for the list view)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// The other party of the conversation
    pub other_participant: ChatUser,
    /// Preview of the most recent message
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Status change for one message. Applied, then discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub conversation_id: String,
    pub new_status: MessageStatus,
}

/// One page of message history, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Cursor for the next (older) page, if any
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Events streamed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Push channel came up or went down
    ConnectionChanged { connected: bool },
    /// Automatic reconnects are used up; only a manual refresh helps now
    ReconnectExhausted,
    /// The conversation list changed (order, previews, counters)
    ConversationsUpdated,
    /// A conversation became the active one
    ConversationSelected { conversation_id: String },
    /// A page of history was merged into a channel
    HistoryLoaded { conversation_id: String },
    /// A message was appended to a channel
    MessageAppended { message: Message },
    /// A receipt moved a message forward
    MessageStatusChanged { receipt: DeliveryReceipt },
    /// The input buffer was cleared at send time
    DraftCleared { conversation_id: String },
    /// A failed send put its content back into the input buffer
    DraftRestored { conversation_id: String, content: String },
    /// Both delivery paths failed
    SendFailed { conversation_id: String, error: String },
    /// Recoverable error worth a toast
    Error { message: String },
    /// Credentials rejected; the session is gone
    SessionExpired,
}
