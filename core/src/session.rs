/// Chat session: the single event loop that owns all chat state
///
/// Message channels, the conversation directory, drafts and in-flight sends
/// are only touched from `ChatSession::run`. User commands, push signals and
/// network completions all arrive as messages; network calls and timers run
/// in spawned tasks that report back, so the loop never blocks on them.
use crate::api::ChatApi;
use crate::channel::MessageChannel;
use crate::config::Config;
use crate::delivery::{DeliveryProtocol, OutgoingMessage, SendCompletion, SendOutcome};
use crate::directory::{ConversationDirectory, InboundOutcome};
use crate::error::{ChatError, Result};
use crate::presence::Presence;
use crate::push::{
    ConnectionEvent, ConnectionManager, InboundEvent, OutboundEvent, PushConnector, PushHandle,
    PushSignal, ReadRequest,
};
use crate::types::{
    ChatEvent, ChatUser, Conversation, DeliveryReceipt, Message, MessagePage, MessageStatus,
    MessageType,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_BUFFER: usize = 64;
const SIGNAL_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Requests from the application to the session loop
enum Command {
    Send {
        conversation_id: String,
        content: String,
        message_type: MessageType,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    SetDraft {
        conversation_id: String,
        content: String,
    },
    Select {
        conversation_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StartChat {
        other_user_id: String,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    LoadOlder {
        conversation_id: String,
    },
    Refresh,
    Conversations {
        reply: oneshot::Sender<Vec<Conversation>>,
    },
    Messages {
        conversation_id: String,
        reply: oneshot::Sender<Vec<Message>>,
    },
    Draft {
        conversation_id: String,
        reply: oneshot::Sender<String>,
    },
    Active {
        reply: oneshot::Sender<Option<String>>,
    },
    InFlight {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Results of spawned network calls
enum Completion {
    ConversationsLoaded(Result<Vec<Conversation>>),
    HistoryLoaded {
        conversation_id: String,
        older: bool,
        result: Result<MessagePage>,
    },
    ConversationOpened {
        result: Result<Conversation>,
        reply: oneshot::Sender<Result<Conversation>>,
    },
    ReadMarked {
        message_id: String,
        result: Result<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Handle to a running session. Clones share the session; the session
/// stops once every handle is dropped or `shutdown` is called.
#[derive(Clone)]
pub struct SessionHandle {
    user_id: String,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ChatEvent>,
    presence: Presence,
    api: Arc<dyn ChatApi>,
}

impl SessionHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Stream of session events for the presentation layer
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> Presence {
        self.presence.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.presence.is_connected()
    }

    /// Send a message. Resolves with the correlation id once the send is
    /// underway (not once delivered); empty content is rejected here.
    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Uuid> {
        self.request(|reply| Command::Send {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            message_type,
            reply,
        })
        .await?
    }

    /// Update the input buffer of a conversation
    pub async fn set_draft(&self, conversation_id: &str, content: &str) -> Result<()> {
        self.command(Command::SetDraft {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    pub async fn draft(&self, conversation_id: &str) -> Result<String> {
        self.request(|reply| Command::Draft {
            conversation_id: conversation_id.to_string(),
            reply,
        })
        .await
    }

    /// Open a conversation: zero its counter, load history, mark read
    pub async fn select(&self, conversation_id: &str) -> Result<()> {
        self.request(|reply| Command::Select {
            conversation_id: conversation_id.to_string(),
            reply,
        })
        .await?
    }

    /// Open the conversation with `other_user_id`, creating it if needed
    pub async fn start_chat(&self, other_user_id: &str) -> Result<Conversation> {
        self.request(|reply| Command::StartChat {
            other_user_id: other_user_id.to_string(),
            reply,
        })
        .await?
    }

    /// Fetch the next older page of a conversation's history
    pub async fn load_older(&self, conversation_id: &str) -> Result<()> {
        self.command(Command::LoadOlder {
            conversation_id: conversation_id.to_string(),
        })
        .await
    }

    /// Manual resync: re-fetch everything and re-arm reconnection
    pub async fn refresh(&self) -> Result<()> {
        self.command(Command::Refresh).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.request(|reply| Command::Conversations { reply }).await
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.request(|reply| Command::Messages {
            conversation_id: conversation_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn active_conversation(&self) -> Result<Option<String>> {
        self.request(|reply| Command::Active { reply }).await
    }

    /// Number of sends not yet settled
    pub async fn in_flight(&self) -> Result<usize> {
        self.request(|reply| Command::InFlight { reply }).await
    }

    /// Users this user may start a chat with
    pub async fn search_users(&self, search: Option<&str>) -> Result<Vec<ChatUser>> {
        self.api.list_chat_eligible_users(search).await
    }

    /// Stop the session and tear down its connection
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command(build(reply)).await?;
        response.await.map_err(|_| ChatError::SessionClosed)
    }
}

pub struct ChatSession {
    user_id: String,
    page_size: usize,
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    push: PushHandle,
    presence: Presence,
    delivery: DeliveryProtocol,
    directory: ConversationDirectory,
    channels: HashMap<String, MessageChannel>,
    drafts: HashMap<String, String>,
    conversations_fetch: FetchState,
    has_connected: bool,
    events: broadcast::Sender<ChatEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

/// Full list fetch bookkeeping: one in flight, at most one queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Idle,
    InFlight,
    InFlightStale,
}

impl ChatSession {
    /// Establish the push connection and spawn the session loop
    pub fn start(
        config: &Config,
        user_id: impl Into<String>,
        token: &str,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn PushConnector>,
    ) -> SessionHandle {
        let user_id = user_id.into();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut connection = ConnectionManager::new(config, connector);
        let push = connection.establish(token, signal_tx);
        let presence = Presence::new(push.state());

        let session = ChatSession {
            user_id: user_id.clone(),
            page_size: config.page_size,
            api: api.clone(),
            connection,
            push,
            presence: presence.clone(),
            delivery: DeliveryProtocol::new(api.clone(), config.send_ack_timeout, send_tx),
            directory: ConversationDirectory::new(user_id.clone()),
            channels: HashMap::new(),
            drafts: HashMap::new(),
            conversations_fetch: FetchState::Idle,
            has_connected: false,
            events: events.clone(),
            completions: completion_tx,
        };
        info!("Starting chat session for {}", user_id);
        tokio::spawn(session.run(command_rx, signal_rx, send_rx, completion_rx));

        SessionHandle {
            user_id,
            commands: command_tx,
            events,
            presence,
            api,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::Receiver<PushSignal>,
        mut sends: mpsc::UnboundedReceiver<SendCompletion>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        self.fetch_conversations();

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => Flow::Stop,
                },
                Some(signal) = signals.recv() => self.on_signal(signal),
                Some(completion) = sends.recv() => self.on_send_completion(completion),
                Some(completion) = completions.recv() => self.on_completion(completion),
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.connection.teardown();
        info!("Chat session for {} stopped", self.user_id);
    }

    // ─── User commands ──────────────────────────────────────────────────────

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Send {
                conversation_id,
                content,
                message_type,
                reply,
            } => {
                let _ = reply.send(self.send(conversation_id, content, message_type));
            }
            Command::SetDraft {
                conversation_id,
                content,
            } => {
                self.drafts.insert(conversation_id, content);
            }
            Command::Select {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.select(&conversation_id));
            }
            Command::StartChat {
                other_user_id,
                reply,
            } => self.start_chat(other_user_id, reply),
            Command::LoadOlder { conversation_id } => self.load_older(&conversation_id),
            Command::Refresh => self.refresh(),
            Command::Conversations { reply } => {
                let _ = reply.send(self.directory.conversations().to_vec());
            }
            Command::Messages {
                conversation_id,
                reply,
            } => {
                let messages = self
                    .channels
                    .get(&conversation_id)
                    .map(|channel| channel.messages().to_vec())
                    .unwrap_or_default();
                let _ = reply.send(messages);
            }
            Command::Draft {
                conversation_id,
                reply,
            } => {
                let draft = self.drafts.get(&conversation_id).cloned().unwrap_or_default();
                let _ = reply.send(draft);
            }
            Command::Active { reply } => {
                let _ = reply.send(self.directory.active().map(str::to_string));
            }
            Command::InFlight { reply } => {
                let _ = reply.send(self.delivery.in_flight());
            }
            Command::Shutdown => {
                info!("Session shutdown requested");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn send(
        &mut self,
        conversation_id: String,
        content: String,
        message_type: MessageType,
    ) -> Result<Uuid> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        self.drafts.remove(&conversation_id);
        self.emit(ChatEvent::DraftCleared {
            conversation_id: conversation_id.clone(),
        });

        let push = self.presence.is_connected().then_some(&self.push);
        let client_id = self.delivery.submit(
            OutgoingMessage {
                conversation_id,
                content,
                message_type,
            },
            push,
        );
        Ok(client_id)
    }

    fn select(&mut self, conversation_id: &str) -> Result<()> {
        if !self.directory.select(conversation_id) {
            return Err(ChatError::Api {
                status: 404,
                message: format!("unknown conversation {}", conversation_id),
            });
        }
        debug!("Conversation {} selected", conversation_id);
        self.emit(ChatEvent::ConversationSelected {
            conversation_id: conversation_id.to_string(),
        });
        self.emit(ChatEvent::ConversationsUpdated);

        self.channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| MessageChannel::new(conversation_id));
        self.mark_conversation_read(conversation_id);
        self.fetch_history(conversation_id, None);
        Ok(())
    }

    fn start_chat(&mut self, other_user_id: String, reply: oneshot::Sender<Result<Conversation>>) {
        if let Some(existing) = self.directory.find_by_participant(&other_user_id).cloned() {
            debug!("Reusing conversation {} with {}", existing.id, other_user_id);
            let result = self.select(&existing.id).map(|_| existing);
            let _ = reply.send(result);
            return;
        }

        let api = self.api.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = api.get_or_create_conversation(&other_user_id).await;
            let _ = completions.send(Completion::ConversationOpened { result, reply });
        });
    }

    fn load_older(&mut self, conversation_id: &str) {
        let cursor = match self.channels.get(conversation_id) {
            Some(channel) => match channel.next_cursor() {
                Some(cursor) => cursor.to_string(),
                None => {
                    debug!("No older history for {}", conversation_id);
                    return;
                }
            },
            None => return,
        };
        self.fetch_history(conversation_id, Some(cursor));
    }

    fn refresh(&mut self) {
        info!("Manual refresh: re-fetching conversations and messages");
        self.fetch_conversations();
        if let Some(active) = self.directory.active().map(str::to_string) {
            self.fetch_history(&active, None);
        }
        self.push.resync();
    }

    // ─── Push signals ───────────────────────────────────────────────────────

    fn on_signal(&mut self, signal: PushSignal) -> Flow {
        match signal {
            PushSignal::Connection(event) => self.on_connection_event(event),
            PushSignal::Inbound(event) => self.dispatch(event),
            PushSignal::Unsent(events) => {
                self.on_unsent(events);
                Flow::Continue
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::Connected => {
                self.emit(ChatEvent::ConnectionChanged { connected: true });
                if self.has_connected {
                    // Catch up on whatever was pushed while we were away
                    info!("Push channel back, resyncing conversations");
                    self.fetch_conversations();
                }
                self.has_connected = true;
            }
            ConnectionEvent::Disconnected { reason } => {
                debug!("Offline: {}", reason);
                self.emit(ChatEvent::ConnectionChanged { connected: false });
            }
            ConnectionEvent::Error { message } => {
                debug!("Push connect attempt failed: {}", message);
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                warn!("Push channel offline after {} reconnect attempts", attempts);
                self.emit(ChatEvent::ReconnectExhausted);
            }
            ConnectionEvent::AuthRejected { message } => {
                return self.expire(&message);
            }
        }
        Flow::Continue
    }

    /// Events the push channel lost with its link
    fn on_unsent(&mut self, events: Vec<OutboundEvent>) {
        for event in events {
            match event {
                OutboundEvent::Read(request) => {
                    debug!("Read mark {} missed the push channel", request.message_id);
                    self.mark_read_over_rest(request.message_id);
                }
                // The ack timer moves the send to REST
                OutboundEvent::Send(request) => {
                    debug!("Push send {} never went out", request.client_id);
                }
                OutboundEvent::MarkDelivered(_) => {}
            }
        }
    }

    /// One exhaustive dispatch over every inbound event kind
    fn dispatch(&mut self, event: InboundEvent) -> Flow {
        match event {
            InboundEvent::Receive(message) => self.on_message(message),
            InboundEvent::Ack(ack) => return self.on_send_completion(SendCompletion::PushAck(ack)),
            InboundEvent::ReadReceipt(receipt) => self.apply_receipt(receipt.to_receipt()),
            InboundEvent::Delivered(notice) => {
                for receipt in notice.to_receipts() {
                    self.apply_receipt(receipt);
                }
            }
            InboundEvent::AuthFailure(failure) => return self.expire(&failure.message),
        }
        Flow::Continue
    }

    fn on_message(&mut self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        match self.directory.apply_inbound(&message) {
            InboundOutcome::Unknown => {
                info!(
                    "Message {} for unknown conversation {}, re-fetching list",
                    message.id, conversation_id
                );
                self.fetch_conversations();
                return;
            }
            InboundOutcome::Active | InboundOutcome::Updated => {
                self.emit(ChatEvent::ConversationsUpdated);
            }
        }

        let appended = self
            .channels
            .get_mut(&conversation_id)
            .map_or(false, |channel| channel.append(message.clone()));
        if appended {
            self.emit(ChatEvent::MessageAppended {
                message: message.clone(),
            });
        }

        if self.directory.is_active(&conversation_id) && message.sender_id != self.user_id {
            self.mark_read(&conversation_id, vec![message.id]);
        }
    }

    fn apply_receipt(&mut self, receipt: DeliveryReceipt) {
        let changed = self
            .channels
            .get_mut(&receipt.conversation_id)
            .map_or(false, |channel| channel.apply_receipt(&receipt));
        if changed {
            self.emit(ChatEvent::MessageStatusChanged { receipt });
        }
    }

    // ─── Send completions ───────────────────────────────────────────────────

    fn on_send_completion(&mut self, completion: SendCompletion) -> Flow {
        let Some(outcome) = self.delivery.complete(completion) else {
            return Flow::Continue;
        };
        match outcome {
            SendOutcome::Delivered { message, path, .. } => {
                debug!("Message {} delivered via {:?}", message.id, path);
                let conversation_id = message.conversation_id.clone();
                if self.directory.record_outgoing(&message) {
                    self.emit(ChatEvent::ConversationsUpdated);
                }
                let channel = self
                    .channels
                    .entry(conversation_id.clone())
                    .or_insert_with(|| MessageChannel::new(conversation_id));
                if channel.append(message.clone()) {
                    self.emit(ChatEvent::MessageAppended { message });
                }
            }
            SendOutcome::Failed { draft, error, .. } => {
                self.drafts
                    .insert(draft.conversation_id.clone(), draft.content.clone());
                self.emit(ChatEvent::DraftRestored {
                    conversation_id: draft.conversation_id.clone(),
                    content: draft.content,
                });
                self.emit(ChatEvent::SendFailed {
                    conversation_id: draft.conversation_id,
                    error: error.to_string(),
                });
                // Draft is back in place before the session goes away
                if error.is_auth() {
                    return self.expire(&error.to_string());
                }
            }
        }
        Flow::Continue
    }

    // ─── Network completions ────────────────────────────────────────────────

    fn on_completion(&mut self, completion: Completion) -> Flow {
        match completion {
            Completion::ConversationsLoaded(result) => {
                let stale = self.conversations_fetch == FetchState::InFlightStale;
                self.conversations_fetch = FetchState::Idle;
                match result {
                    Ok(conversations) => {
                        info!("Loaded {} conversations", conversations.len());
                        self.directory.replace_all(conversations);
                        self.emit(ChatEvent::ConversationsUpdated);
                    }
                    Err(e) if e.is_auth() => return self.expire(&e.to_string()),
                    Err(e) => self.report("Failed to load conversations", &e),
                }
                if stale {
                    self.fetch_conversations();
                }
            }
            Completion::HistoryLoaded {
                conversation_id,
                older,
                result,
            } => match result {
                Ok(page) => {
                    let channel = self
                        .channels
                        .entry(conversation_id.clone())
                        .or_insert_with(|| MessageChannel::new(conversation_id.clone()));
                    if older {
                        channel.prepend_older(page);
                    } else {
                        channel.replace_history(page);
                    }
                    self.emit(ChatEvent::HistoryLoaded {
                        conversation_id: conversation_id.clone(),
                    });
                    if self.directory.is_active(&conversation_id) {
                        self.mark_conversation_read(&conversation_id);
                    }
                }
                Err(e) if e.is_auth() => return self.expire(&e.to_string()),
                Err(e) => self.report("Failed to load messages", &e),
            },
            Completion::ConversationOpened { result, reply } => match result {
                Ok(conversation) => {
                    info!(
                        "Opened conversation {} with {}",
                        conversation.id, conversation.other_participant.id
                    );
                    let conversation_id = conversation.id.clone();
                    self.directory.upsert(conversation.clone());
                    let result = self.select(&conversation_id).map(|_| conversation);
                    let _ = reply.send(result);
                }
                Err(e) if e.is_auth() => {
                    let message = e.to_string();
                    let _ = reply.send(Err(e));
                    return self.expire(&message);
                }
                Err(e) => {
                    self.report("Failed to open conversation", &e);
                    let _ = reply.send(Err(e));
                }
            },
            Completion::ReadMarked { message_id, result } => match result {
                Ok(()) => debug!("Marked {} read over REST", message_id),
                Err(e) if e.is_auth() => return self.expire(&e.to_string()),
                Err(e) => warn!("Failed to mark {} read: {}", message_id, e),
            },
        }
        Flow::Continue
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn fetch_conversations(&mut self) {
        match self.conversations_fetch {
            FetchState::Idle => {}
            FetchState::InFlight | FetchState::InFlightStale => {
                self.conversations_fetch = FetchState::InFlightStale;
                return;
            }
        }
        self.conversations_fetch = FetchState::InFlight;

        let api = self.api.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = api.list_conversations().await;
            let _ = completions.send(Completion::ConversationsLoaded(result));
        });
    }

    fn fetch_history(&self, conversation_id: &str, cursor: Option<String>) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        let conversation_id = conversation_id.to_string();
        let limit = self.page_size;
        tokio::spawn(async move {
            let older = cursor.is_some();
            let result = api
                .list_messages(&conversation_id, cursor.as_deref(), Some(limit))
                .await;
            let _ = completions.send(Completion::HistoryLoaded {
                conversation_id,
                older,
                result,
            });
        });
    }

    /// Batch-mark everything from the other side as read
    fn mark_conversation_read(&mut self, conversation_id: &str) {
        let unread = match self.channels.get(conversation_id) {
            Some(channel) => channel.unread_from_others(&self.user_id),
            None => return,
        };
        if !unread.is_empty() {
            self.mark_read(conversation_id, unread);
        }
    }

    fn mark_read(&mut self, conversation_id: &str, message_ids: Vec<String>) {
        for message_id in message_ids {
            self.apply_receipt(DeliveryReceipt {
                message_id: message_id.clone(),
                conversation_id: conversation_id.to_string(),
                new_status: MessageStatus::Read,
            });

            let event = OutboundEvent::Read(ReadRequest {
                message_id: message_id.clone(),
            });
            if self.presence.is_connected() && self.push.emit(event) {
                continue;
            }
            self.mark_read_over_rest(message_id);
        }
    }

    fn mark_read_over_rest(&self, message_id: String) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = api.mark_read(&message_id).await;
            let _ = completions.send(Completion::ReadMarked { message_id, result });
        });
    }

    fn expire(&mut self, reason: &str) -> Flow {
        error!("Session credentials rejected: {}", reason);
        self.connection.teardown();
        self.emit(ChatEvent::SessionExpired);
        Flow::Stop
    }

    fn report(&self, context: &str, error: &ChatError) {
        warn!("{}: {}", context, error);
        self.emit(ChatEvent::Error {
            message: format!("{}: {}", context, error),
        });
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
