/// SchoolChat core - real-time messaging client
///
/// Push-first delivery over a WebSocket with REST fallback, per-conversation
/// message logs with monotonic read receipts, and a conversation list kept
/// in activity order.

pub mod api;
pub mod channel;
pub mod client;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod presence;
pub mod push;
pub mod session;
pub mod types;

pub use api::{ChatApi, HttpChatApi};
pub use client::{ChatClient, Credentials, HttpTransports, TransportFactory};
pub use config::Config;
pub use error::{ChatError, Result};
pub use presence::Presence;
pub use session::{ChatSession, SessionHandle};
pub use types::{
    ChatEvent, ChatUser, Conversation, DeliveryReceipt, Message, MessagePage, MessageStatus,
    MessageType,
};
