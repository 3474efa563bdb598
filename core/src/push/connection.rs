/// Push connection lifecycle: connect, detect loss, bounded auto-reconnect
use crate::config::Config;
use crate::error::Result;
use crate::push::protocol::{InboundEvent, MarkDelivered, OutboundEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Connection phase of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Not connected (between attempts, or before the first one)
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and receiving
    Connected,
    /// Automatic reconnects used up; waiting for a manual resync
    Exhausted,
    /// Torn down by logout or an auth failure. Terminal.
    TornDown,
}

/// Observable connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub last_error: Option<String>,
}

impl ConnectionState {
    fn new(phase: ConnectionPhase) -> Self {
        Self {
            phase,
            last_error: None,
        }
    }

    pub fn connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }
}

/// Lifecycle notifications for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String },
    Error { message: String },
    ReconnectExhausted { attempts: u32 },
    AuthRejected { message: String },
}

/// Everything the connection task hands to the session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum PushSignal {
    Connection(ConnectionEvent),
    Inbound(InboundEvent),
    /// Events accepted by `PushHandle::emit` that never reached a live link
    Unsent(Vec<OutboundEvent>),
}

/// An open push connection as a pair of text-frame channels.
/// The inbound side closing means the connection was lost.
pub struct PushLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens push connections for a session token
#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn connect(&self, token: &str) -> Result<PushLink>;
}

/// Cheap handle to the live connection
#[derive(Clone)]
pub struct PushHandle {
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    resync: mpsc::UnboundedSender<()>,
    state: watch::Receiver<ConnectionState>,
}

impl PushHandle {
    /// Queue an event for the push channel. Returns false when not connected.
    pub fn emit(&self, event: OutboundEvent) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outbound.send(event).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected()
    }

    /// Re-arm automatic reconnection after exhaustion. No-op otherwise.
    pub fn resync(&self) {
        let _ = self.resync.send(());
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

struct LiveConnection {
    task: JoinHandle<()>,
}

/// Owns the single live push connection of a session
pub struct ConnectionManager {
    connector: Arc<dyn PushConnector>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    live: Option<LiveConnection>,
}

impl ConnectionManager {
    pub fn new(config: &Config, connector: Arc<dyn PushConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::new(ConnectionPhase::Disconnected));
        Self {
            connector,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay,
            state: Arc::new(state),
            live: None,
        }
    }

    /// Start the push connection for `token`, replacing any live one
    pub fn establish(&mut self, token: &str, signals: mpsc::Sender<PushSignal>) -> PushHandle {
        if self.live.is_some() {
            info!("Replacing live push connection");
            self.teardown();
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        self.state
            .send_replace(ConnectionState::new(ConnectionPhase::Disconnected));

        let worker = ConnectionWorker {
            connector: self.connector.clone(),
            token: token.to_string(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            state: self.state.clone(),
            signals,
            outbound: outbound_rx,
            resync: resync_rx,
        };
        let task = tokio::spawn(worker.run());
        self.live = Some(LiveConnection { task });

        PushHandle {
            outbound: outbound_tx,
            resync: resync_tx,
            state: self.state.subscribe(),
        }
    }

    /// Stop the connection for good (logout / credential change)
    pub fn teardown(&mut self) {
        if let Some(live) = self.live.take() {
            live.task.abort();
            debug!("Push connection task aborted");
        }
        self.state
            .send_replace(ConnectionState::new(ConnectionPhase::TornDown));
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.task.abort();
        }
    }
}

enum LinkEnd {
    Lost {
        reason: String,
        unsent: Option<OutboundEvent>,
    },
    AuthRejected(String),
    SessionGone,
}

struct ConnectionWorker {
    connector: Arc<dyn PushConnector>,
    token: String,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    signals: mpsc::Sender<PushSignal>,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    resync: mpsc::UnboundedReceiver<()>,
}

impl ConnectionWorker {
    async fn run(mut self) {
        let mut retries: u32 = 0;

        loop {
            self.set_phase(ConnectionPhase::Connecting, None);
            debug!("Connecting push channel (retry {})", retries);

            match self.connector.connect(&self.token).await {
                Ok(link) => {
                    retries = 0;
                    match self.drive(link).await {
                        LinkEnd::Lost { reason, unsent } => {
                            warn!("Push connection lost: {}", reason);
                            self.set_phase(ConnectionPhase::Disconnected, Some(reason.clone()));
                            // emit() refuses from here on, so the queue is final
                            if !self.hand_back(unsent.into_iter().collect()).await {
                                return;
                            }
                            if !self
                                .signal(PushSignal::Connection(ConnectionEvent::Disconnected {
                                    reason,
                                }))
                                .await
                            {
                                return;
                            }
                        }
                        LinkEnd::AuthRejected(message) => {
                            self.reject(message).await;
                            return;
                        }
                        LinkEnd::SessionGone => return,
                    }
                }
                Err(e) if e.is_auth() => {
                    self.reject(e.to_string()).await;
                    return;
                }
                Err(e) => {
                    warn!("Failed to connect push channel: {}", e);
                    let message = e.to_string();
                    self.set_phase(ConnectionPhase::Disconnected, Some(message.clone()));
                    if !self
                        .signal(PushSignal::Connection(ConnectionEvent::Error { message }))
                        .await
                    {
                        return;
                    }
                }
            }

            if retries >= self.reconnect_attempts {
                error!(
                    "Push channel gave up after {} reconnect attempts",
                    self.reconnect_attempts
                );
                // Resync requests from before exhaustion don't count
                while self.resync.try_recv().is_ok() {}
                let last_error = self.state.borrow().last_error.clone();
                self.set_phase(ConnectionPhase::Exhausted, last_error);
                if !self
                    .signal(PushSignal::Connection(ConnectionEvent::ReconnectExhausted {
                        attempts: self.reconnect_attempts,
                    }))
                    .await
                {
                    return;
                }
                match self.resync.recv().await {
                    Some(()) => {
                        info!("Manual resync requested, reconnecting push channel");
                        retries = 0;
                        continue;
                    }
                    None => return,
                }
            }

            retries += 1;
            sleep(self.reconnect_delay).await;
        }
    }

    /// Pump one open link until it ends.
    async fn drive(&mut self, link: PushLink) -> LinkEnd {
        let PushLink {
            outbound,
            mut inbound,
        } = link;

        // Leftovers must not be replayed on the new link
        if !self.hand_back(Vec::new()).await {
            return LinkEnd::SessionGone;
        }

        // The inbound receiver is owned here before anyone hears "connected"
        self.set_phase(ConnectionPhase::Connected, None);
        info!("Push channel connected");
        if !self
            .signal(PushSignal::Connection(ConnectionEvent::Connected))
            .await
        {
            return LinkEnd::SessionGone;
        }

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(text) = frame else {
                        return LinkEnd::Lost {
                            reason: "push channel closed".to_string(),
                            unsent: None,
                        };
                    };
                    let event = match InboundEvent::from_text(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            debug!("Ignoring undecodable push frame: {}", e);
                            continue;
                        }
                    };
                    if let InboundEvent::AuthFailure(failure) = event {
                        return LinkEnd::AuthRejected(failure.message);
                    }

                    let observed = match &event {
                        InboundEvent::Receive(message) => Some(message.id.clone()),
                        _ => None,
                    };
                    if !self.signal(PushSignal::Inbound(event)).await {
                        return LinkEnd::SessionGone;
                    }
                    // Only after the session has the message
                    if let Some(message_id) = observed {
                        let ack = OutboundEvent::MarkDelivered(MarkDelivered {
                            message_ids: vec![message_id],
                        });
                        if let Err(reason) = write_frame(&outbound, &ack).await {
                            return LinkEnd::Lost { reason, unsent: None };
                        }
                    }
                }
                event = self.outbound.recv() => {
                    let Some(event) = event else {
                        return LinkEnd::SessionGone;
                    };
                    debug!("Push send {}", event);
                    if let Err(reason) = write_frame(&outbound, &event).await {
                        return LinkEnd::Lost {
                            reason,
                            unsent: Some(event),
                        };
                    }
                }
            }
        }
    }

    /// Return queued events to the session. False if the session is gone.
    async fn hand_back(&mut self, mut unsent: Vec<OutboundEvent>) -> bool {
        while let Ok(event) = self.outbound.try_recv() {
            unsent.push(event);
        }
        if unsent.is_empty() {
            return true;
        }
        debug!("Handing {} unsent events back to the session", unsent.len());
        self.signal(PushSignal::Unsent(unsent)).await
    }

    async fn reject(&mut self, message: String) {
        error!("Push channel rejected credentials: {}", message);
        self.set_phase(ConnectionPhase::TornDown, Some(message.clone()));
        let _ = self
            .signal(PushSignal::Connection(ConnectionEvent::AuthRejected {
                message,
            }))
            .await;
    }

    fn set_phase(&self, phase: ConnectionPhase, last_error: Option<String>) {
        self.state.send_modify(|state| {
            state.phase = phase;
            if last_error.is_some() || phase == ConnectionPhase::Connected {
                state.last_error = last_error;
            }
        });
    }

    async fn signal(&self, signal: PushSignal) -> bool {
        self.signals.send(signal).await.is_ok()
    }
}

async fn write_frame(
    outbound: &mpsc::Sender<String>,
    event: &OutboundEvent,
) -> std::result::Result<(), String> {
    let text = event
        .to_text()
        .map_err(|e| format!("failed to encode {}: {}", event, e))?;
    outbound
        .send(text)
        .await
        .map_err(|_| "push channel writer closed".to_string())
}
