#![allow(dead_code)]
/// In-memory fakes of the REST API and the push transport
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use schoolchat_core::push::{InboundEvent, OutboundEvent, PushConnector, PushLink};
use schoolchat_core::{
    ChatApi, ChatError, ChatEvent, ChatSession, ChatUser, Config, Conversation, Message,
    MessagePage, MessageStatus, MessageType, Result, SessionHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const ME: &str = "me";

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, minute, 0).unwrap()
}

pub fn user(id: &str) -> ChatUser {
    ChatUser {
        id: id.to_string(),
        name: format!("User {}", id),
        role: Some("teacher".to_string()),
    }
}

pub fn conversation(id: &str, other: &str, minute: u32, unread: u32) -> Conversation {
    Conversation {
        id: id.to_string(),
        other_participant: user(other),
        last_message: None,
        unread_count: unread,
        updated_at: at(minute),
    }
}

pub fn message(id: &str, conversation_id: &str, sender: &str, minute: u32) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        content: format!("content of {}", id),
        message_type: MessageType::Text,
        created_at: at(minute),
        status: MessageStatus::Sent,
    }
}

// ─── REST fake ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateBehavior {
    Succeed,
    Fail,
    Unauthorized,
}

struct ApiState {
    conversations: Vec<Conversation>,
    histories: HashMap<String, Vec<Message>>,
    /// Cursor returned with the newest page, per conversation
    first_cursors: HashMap<String, String>,
    older_pages: HashMap<String, MessagePage>,
    cursors: Vec<Option<String>>,
    users: Vec<ChatUser>,
    create: CreateBehavior,
    unauthorized: bool,
    next_id: u32,
    created: Vec<(String, String)>,
    read_marks: Vec<String>,
    opened: Vec<String>,
    list_calls: usize,
}

pub struct FakeApi {
    state: Mutex<ApiState>,
}

impl FakeApi {
    pub fn new(conversations: Vec<Conversation>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ApiState {
                conversations,
                histories: HashMap::new(),
                first_cursors: HashMap::new(),
                older_pages: HashMap::new(),
                cursors: Vec::new(),
                users: vec![user("u1"), user("u2"), user("u3")],
                create: CreateBehavior::Succeed,
                unauthorized: false,
                next_id: 1,
                created: Vec::new(),
                read_marks: Vec::new(),
                opened: Vec::new(),
                list_calls: 0,
            }),
        })
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().unwrap().conversations = conversations;
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .unwrap()
            .histories
            .insert(conversation_id.to_string(), messages);
    }

    /// Newest page plus the cursor that leads past it
    pub fn set_history_page(&self, conversation_id: &str, messages: Vec<Message>, cursor: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .histories
            .insert(conversation_id.to_string(), messages);
        state
            .first_cursors
            .insert(conversation_id.to_string(), cursor.to_string());
    }

    /// Page served for `cursor`
    pub fn set_older_page(&self, cursor: &str, messages: Vec<Message>, next_cursor: Option<&str>) {
        self.state.lock().unwrap().older_pages.insert(
            cursor.to_string(),
            MessagePage {
                messages,
                next_cursor: next_cursor.map(str::to_string),
            },
        );
    }

    /// Cursor of every list-messages call, in order
    pub fn history_cursors(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().cursors.clone()
    }

    pub fn set_create(&self, behavior: CreateBehavior) {
        self.state.lock().unwrap().create = behavior;
    }

    pub fn set_unauthorized(&self) {
        self.state.lock().unwrap().unauthorized = true;
    }

    /// (conversation id, content) of every create-message call
    pub fn created(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn read_marks(&self) -> Vec<String> {
        self.state.lock().unwrap().read_marks.clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    fn check_auth(&self) -> Result<()> {
        if self.state.lock().unwrap().unauthorized {
            return Err(ChatError::Unauthorized("session expired".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        Ok(state.conversations.clone())
    }

    async fn get_or_create_conversation(&self, other_user_id: &str) -> Result<Conversation> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        state.opened.push(other_user_id.to_string());
        if let Some(existing) = state
            .conversations
            .iter()
            .find(|c| c.other_participant.id == other_user_id)
        {
            return Ok(existing.clone());
        }
        let created = conversation(&format!("c-{}", other_user_id), other_user_id, 59, 0);
        state.conversations.push(created.clone());
        Ok(created)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        _limit: Option<usize>,
    ) -> Result<MessagePage> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        state.cursors.push(cursor.map(str::to_string));
        if let Some(cursor) = cursor {
            return Ok(state.older_pages.get(cursor).cloned().unwrap_or(MessagePage {
                messages: Vec::new(),
                next_cursor: None,
            }));
        }
        Ok(MessagePage {
            messages: state
                .histories
                .get(conversation_id)
                .cloned()
                .unwrap_or_default(),
            next_cursor: state.first_cursors.get(conversation_id).cloned(),
        })
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let mut state = self.state.lock().unwrap();
        state
            .created
            .push((conversation_id.to_string(), content.to_string()));
        match state.create {
            CreateBehavior::Succeed => {
                let id = format!("rest-{}", state.next_id);
                state.next_id += 1;
                let mut stored = message(&id, conversation_id, ME, 50);
                stored.content = content.to_string();
                stored.message_type = message_type;
                Ok(stored)
            }
            CreateBehavior::Fail => Err(ChatError::Api {
                status: 500,
                message: "database unavailable".to_string(),
            }),
            CreateBehavior::Unauthorized => {
                Err(ChatError::Unauthorized("session expired".to_string()))
            }
        }
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        self.check_auth()?;
        self.state
            .lock()
            .unwrap()
            .read_marks
            .push(message_id.to_string());
        Ok(())
    }

    async fn list_chat_eligible_users(&self, search: Option<&str>) -> Result<Vec<ChatUser>> {
        self.check_auth()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .filter(|u| search.map_or(true, |s| u.name.contains(s)))
            .cloned()
            .collect())
    }
}

// ─── Push fake ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Accept,
    /// Never completes: the client stays offline
    Hang,
    RejectAuth,
}

/// Server side of one accepted push connection. Dropping it closes the link.
pub struct ServerEnd {
    to_client: mpsc::Sender<String>,
    from_client: mpsc::Receiver<String>,
}

impl ServerEnd {
    pub async fn push(&self, event: InboundEvent) {
        let text = event.to_text().unwrap();
        self.to_client.send(text).await.unwrap();
    }

    /// Next frame written by the client
    pub async fn next_event(&mut self) -> OutboundEvent {
        let text = timeout(Duration::from_secs(30), self.from_client.recv())
            .await
            .expect("no frame from client")
            .expect("client closed the link");
        OutboundEvent::from_text(&text).unwrap()
    }

    /// Skip frames until one matches
    pub async fn next_matching(&mut self, wanted: impl Fn(&OutboundEvent) -> bool) -> OutboundEvent {
        loop {
            let event = self.next_event().await;
            if wanted(&event) {
                return event;
            }
        }
    }
}

pub struct FakeConnector {
    mode: Mutex<ConnectMode>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
    links_tx: mpsc::UnboundedSender<ServerEnd>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            mode: Mutex::new(ConnectMode::Accept),
            failures_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            links_tx,
            links_rx: tokio::sync::Mutex::new(links_rx),
        })
    }

    /// Connector whose connect never completes
    pub fn offline() -> Arc<Self> {
        let connector = Self::new();
        *connector.mode.lock().unwrap() = ConnectMode::Hang;
        connector
    }

    pub fn rejecting() -> Arc<Self> {
        let connector = Self::new();
        *connector.mode.lock().unwrap() = ConnectMode::RejectAuth;
        connector
    }

    /// Fail the next `count` connection attempts with a transport error
    pub fn failing(count: u32) -> Arc<Self> {
        let connector = Self::new();
        connector.failures_left.store(count, Ordering::SeqCst);
        connector
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the client to open its next connection
    pub async fn accept(&self) -> ServerEnd {
        let mut links = self.links_rx.lock().await;
        timeout(Duration::from_secs(60), links.recv())
            .await
            .expect("client never connected")
            .expect("connector dropped")
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, token: &str) -> Result<PushLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            ConnectMode::Hang => std::future::pending::<()>().await,
            ConnectMode::RejectAuth => {
                return Err(ChatError::Unauthorized(format!("token {} revoked", token)));
            }
            ConnectMode::Accept => {}
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ChatError::Connection("connection refused".to_string()));
        }

        let (outbound, from_client) = mpsc::channel(64);
        let (to_client, inbound) = mpsc::channel(64);
        let _ = self.links_tx.send(ServerEnd {
            to_client,
            from_client,
        });
        Ok(PushLink { outbound, inbound })
    }
}

// ─── Session helpers ────────────────────────────────────────────────────────

pub fn start_session(
    api: Arc<FakeApi>,
    connector: Arc<FakeConnector>,
) -> (SessionHandle, broadcast::Receiver<ChatEvent>) {
    let session = ChatSession::start(&Config::default(), ME, "token-1", api, connector);
    let events = session.subscribe();
    (session, events)
}

/// Wait for the first event matching `wanted`, skipping others
pub async fn wait_for(
    events: &mut broadcast::Receiver<ChatEvent>,
    wanted: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

/// Wait until both the baseline list and the push channel are up
pub async fn wait_ready(events: &mut broadcast::Receiver<ChatEvent>) {
    let mut listed = false;
    let mut connected = false;
    while !(listed && connected) {
        match wait_for(events, |_| true).await {
            ChatEvent::ConversationsUpdated => listed = true,
            ChatEvent::ConnectionChanged { connected: true } => connected = true,
            _ => {}
        }
    }
}

/// Wait until the baseline conversation list is loaded
pub async fn wait_listed(events: &mut broadcast::Receiver<ChatEvent>) {
    wait_for(events, |e| matches!(e, ChatEvent::ConversationsUpdated)).await;
}

/// Select a conversation and wait for its history
pub async fn open(
    session: &SessionHandle,
    events: &mut broadcast::Receiver<ChatEvent>,
    conversation_id: &str,
) {
    session.select(conversation_id).await.unwrap();
    let id = conversation_id.to_string();
    wait_for(events, |e| {
        matches!(e, ChatEvent::HistoryLoaded { conversation_id } if *conversation_id == id)
    })
    .await;
}
