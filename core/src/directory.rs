/// Conversation list: ordering, previews, unread counters
use crate::types::{Conversation, Message};

/// What an inbound message did to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Message for the conversation on screen; counter untouched
    Active,
    /// Known conversation updated and moved up
    Updated,
    /// Conversation not in the list; a full re-fetch is needed
    Unknown,
}

/// Ordered list of conversations, newest activity first
#[derive(Debug, Clone)]
pub struct ConversationDirectory {
    self_id: String,
    conversations: Vec<Conversation>,
    active: Option<String>,
}

impl ConversationDirectory {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            conversations: Vec::new(),
            active: None,
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.as_deref() == Some(conversation_id)
    }

    /// Install the server's list (baseline or resync)
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
        if let Some(active) = self.active.clone() {
            if let Some(conv) = self.get_mut(&active) {
                conv.unread_count = 0;
            }
        }
        self.resort();
    }

    /// Make a conversation active and clear its counter.
    /// Returns false if the conversation is unknown.
    pub fn select(&mut self, conversation_id: &str) -> bool {
        match self.get_mut(conversation_id) {
            Some(conv) => {
                conv.unread_count = 0;
                self.active = Some(conversation_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Fold an inbound push message into the list
    pub fn apply_inbound(&mut self, message: &Message) -> InboundOutcome {
        let is_active = self.is_active(&message.conversation_id);
        let from_self = message.sender_id == self.self_id;
        let Some(conv) = self.get_mut(&message.conversation_id) else {
            return InboundOutcome::Unknown;
        };

        touch(conv, message);
        let outcome = if is_active {
            InboundOutcome::Active
        } else {
            if !from_self {
                conv.unread_count = conv.unread_count.saturating_add(1);
            }
            InboundOutcome::Updated
        };
        self.resort();
        outcome
    }

    /// Reflect a message we sent. Returns false if the conversation is unknown.
    pub fn record_outgoing(&mut self, message: &Message) -> bool {
        let Some(conv) = self.get_mut(&message.conversation_id) else {
            return false;
        };
        touch(conv, message);
        self.resort();
        true
    }

    /// Existing conversation with this other participant, if any
    pub fn find_by_participant(&self, user_id: &str) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| c.other_participant.id == user_id)
    }

    /// Insert or replace a single conversation (after get-or-create)
    pub fn upsert(&mut self, conversation: Conversation) {
        match self.get_mut(&conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        self.resort();
    }

    fn get_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == conversation_id)
    }

    fn resort(&mut self) {
        // Stable: ties keep their previous relative order
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

/// Last-write-wins update of preview and timestamp
fn touch(conv: &mut Conversation, message: &Message) {
    let newer = conv
        .last_message
        .as_ref()
        .map_or(true, |last| message.created_at >= last.created_at);
    if newer {
        conv.last_message = Some(message.clone());
    }
    if message.created_at > conv.updated_at {
        conv.updated_at = message.created_at;
    }
}
