/// Push channel event contract
///
/// Every frame is a JSON text frame `{"event": "<name>", "data": {...}}`.
use crate::types::{DeliveryReceipt, Message, MessageStatus, MessageType};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Events the client sends over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    /// Send a message; answered by `chat:ack` carrying the same `clientId`
    #[serde(rename = "chat:send")]
    Send(SendRequest),

    /// Tell senders their messages reached this client
    #[serde(rename = "chat:mark_delivered")]
    MarkDelivered(MarkDelivered),

    /// Tell the sender a message was read
    #[serde(rename = "chat:read")]
    Read(ReadRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Correlation id echoed back in the ack
    pub client_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkDelivered {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub message_id: String,
}

/// Events the server pushes to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    /// A new message in one of our conversations
    #[serde(rename = "chat:receive")]
    Receive(Message),

    /// Outcome of an earlier `chat:send`
    #[serde(rename = "chat:ack")]
    Ack(SendAck),

    /// The recipient read one of our messages
    #[serde(rename = "chat:read_receipt")]
    ReadReceipt(ReadReceipt),

    /// The recipient's client received some of our messages
    #[serde(rename = "chat:delivered")]
    Delivered(DeliveredNotice),

    /// Credentials rejected by the push server
    #[serde(rename = "auth:error")]
    AuthFailure(AuthFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub client_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Message>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SendAck {
    /// The stored message on success, the server's reason otherwise
    pub fn into_result(self) -> Result<Message, String> {
        match (self.success, self.data) {
            (true, Some(message)) => Ok(message),
            (true, None) => Err("ack carried no message".to_string()),
            (false, _) => Err(self.error.unwrap_or_else(|| "send rejected".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredNotice {
    pub message_ids: Vec<String>,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFailure {
    pub message: String,
}

impl OutboundEvent {
    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Get event name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundEvent::Send(_) => "chat:send",
            OutboundEvent::MarkDelivered(_) => "chat:mark_delivered",
            OutboundEvent::Read(_) => "chat:read",
        }
    }
}

impl InboundEvent {
    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame. Unknown event names are an error.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Get event name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            InboundEvent::Receive(_) => "chat:receive",
            InboundEvent::Ack(_) => "chat:ack",
            InboundEvent::ReadReceipt(_) => "chat:read_receipt",
            InboundEvent::Delivered(_) => "chat:delivered",
            InboundEvent::AuthFailure(_) => "auth:error",
        }
    }
}

impl ReadReceipt {
    pub fn to_receipt(&self) -> DeliveryReceipt {
        DeliveryReceipt {
            message_id: self.message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            new_status: MessageStatus::Read,
        }
    }
}

impl DeliveredNotice {
    pub fn to_receipts(&self) -> Vec<DeliveryReceipt> {
        self.message_ids
            .iter()
            .map(|id| DeliveryReceipt {
                message_id: id.clone(),
                conversation_id: self.conversation_id.clone(),
                new_status: MessageStatus::Delivered,
            })
            .collect()
    }
}

impl fmt::Display for OutboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Outbound({})", self.event_name())
    }
}

impl fmt::Display for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inbound({})", self.event_name())
    }
}
