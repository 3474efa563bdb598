/// Per-conversation message log
///
/// Messages keep arrival order; the only mutation after append is a forward
/// status change driven by a receipt with a matching id.
use crate::types::{DeliveryReceipt, Message, MessagePage, MessageStatus};

#[derive(Debug, Clone)]
pub struct MessageChannel {
    conversation_id: String,
    messages: Vec<Message>,
    next_cursor: Option<String>,
    loaded: bool,
}

impl MessageChannel {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            next_cursor: None,
            loaded: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    /// Cursor for the next older page, if the server has more
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    /// Append in arrival order. Returns false for a duplicate id or a
    /// message that belongs to another conversation.
    pub fn append(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id || self.get(&message.id).is_some() {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Apply a receipt if it moves the message forward. Returns true on change.
    pub fn apply_receipt(&mut self, receipt: &DeliveryReceipt) -> bool {
        match self.messages.iter_mut().find(|m| m.id == receipt.message_id) {
            Some(message) if message.status.is_advanced_by(receipt.new_status) => {
                message.status = receipt.new_status;
                true
            }
            _ => false,
        }
    }

    /// Replace with the newest page from the server. Older pages already
    /// loaded stay in front of it; push arrivals missing from the page
    /// stay after it. Statuses never move backwards.
    pub fn replace_history(&mut self, page: MessagePage) {
        let known: Vec<Message> = std::mem::take(&mut self.messages);
        let first_overlap = known
            .iter()
            .position(|m| page.messages.iter().any(|p| p.id == m.id));
        let page_start = page.messages.first().map(|m| m.created_at);

        let mut older = Vec::new();
        let mut newer = Vec::new();
        let mut merged = page.messages;
        for (index, message) in known.into_iter().enumerate() {
            if let Some(existing) = merged.iter_mut().find(|m| m.id == message.id) {
                // Keep whichever status is further along
                if existing.status < message.status {
                    existing.status = message.status;
                }
                continue;
            }
            let before_page = match (first_overlap, page_start) {
                (Some(overlap), _) => index < overlap,
                (None, Some(start)) => message.created_at < start,
                (None, None) => false,
            };
            if before_page {
                older.push(message);
            } else {
                newer.push(message);
            }
        }

        // A kept older page still knows where the history continues
        if older.is_empty() || !self.loaded {
            self.next_cursor = page.next_cursor;
        }
        older.append(&mut merged);
        older.append(&mut newer);
        self.messages = older;
        self.loaded = true;
    }

    /// Prepend an older page (pagination). Already-known ids are skipped.
    pub fn prepend_older(&mut self, page: MessagePage) {
        let mut older: Vec<Message> = page
            .messages
            .into_iter()
            .filter(|m| m.conversation_id == self.conversation_id && self.get(&m.id).is_none())
            .collect();
        older.append(&mut self.messages);
        self.messages = older;
        self.next_cursor = page.next_cursor;
    }

    /// Ids of messages from other participants not yet marked read
    pub fn unread_from_others(&self, self_id: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.sender_id != self_id && m.status < MessageStatus::Read)
            .map(|m| m.id.clone())
            .collect()
    }
}
