/// Send path: push first with a bounded wait for the ack, REST fallback
/// when the push channel is down, rejects the send, or stays silent.
///
/// Every send is tracked by a client-generated correlation id. Push acks,
/// the ack timer and the fallback call all report back here, and each one
/// only takes effect if the send is still in the phase it expects:
///
/// ```text
/// submit ──connected──> AwaitingAck ──ack ok──────────────> settled (push)
///    │                       │ ack error / timer fired
///    └──offline──────────────┴──> FallingBack ──REST ok/err──> settled
/// ```
///
/// An ack arriving after the send left `AwaitingAck` is discarded, so a
/// send appends at most one message even when both paths complete.
use crate::api::ChatApi;
use crate::error::ChatError;
use crate::push::{OutboundEvent, PushHandle, SendAck, SendRequest};
use crate::types::{Message, MessageType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A send as the user typed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation_id: String,
    /// Original input, restored into the draft on failure
    pub content: String,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    AwaitingAck,
    FallingBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Push,
    Fallback,
}

/// Completion sources racing for one send
#[derive(Debug)]
pub enum SendCompletion {
    PushAck(SendAck),
    AckTimeout { client_id: Uuid },
    Fallback {
        client_id: Uuid,
        result: Result<Message, ChatError>,
    },
}

/// Visible result of a settled send
#[derive(Debug)]
pub enum SendOutcome {
    Delivered {
        client_id: Uuid,
        message: Message,
        path: DeliveryPath,
    },
    Failed {
        client_id: Uuid,
        draft: OutgoingMessage,
        error: ChatError,
    },
}

struct InFlightSend {
    draft: OutgoingMessage,
    phase: SendPhase,
    timer: Option<AbortHandle>,
}

pub struct DeliveryProtocol {
    api: Arc<dyn ChatApi>,
    ack_timeout: Duration,
    completions: mpsc::UnboundedSender<SendCompletion>,
    in_flight: HashMap<Uuid, InFlightSend>,
}

impl DeliveryProtocol {
    pub fn new(
        api: Arc<dyn ChatApi>,
        ack_timeout: Duration,
        completions: mpsc::UnboundedSender<SendCompletion>,
    ) -> Self {
        Self {
            api,
            ack_timeout,
            completions,
            in_flight: HashMap::new(),
        }
    }

    /// Start a send. `push` is `None` when the push channel is down.
    pub fn submit(&mut self, draft: OutgoingMessage, push: Option<&PushHandle>) -> Uuid {
        let client_id = Uuid::new_v4();
        let request = OutboundEvent::Send(SendRequest {
            conversation_id: draft.conversation_id.clone(),
            content: draft.content.trim().to_string(),
            message_type: draft.message_type,
            client_id,
        });

        let pushed = push.map_or(false, |push| push.emit(request));
        if pushed {
            debug!(
                "Send {} pushed, waiting {:?} for ack",
                client_id, self.ack_timeout
            );
            let timer = self.spawn_ack_timer(client_id);
            self.in_flight.insert(
                client_id,
                InFlightSend {
                    draft,
                    phase: SendPhase::AwaitingAck,
                    timer: Some(timer),
                },
            );
        } else {
            info!("Push channel offline, sending {} over REST", client_id);
            self.spawn_fallback(client_id, draft.clone());
            self.in_flight.insert(
                client_id,
                InFlightSend {
                    draft,
                    phase: SendPhase::FallingBack,
                    timer: None,
                },
            );
        }
        client_id
    }

    /// Feed a completion; returns the outcome if this one settled the send
    pub fn complete(&mut self, completion: SendCompletion) -> Option<SendOutcome> {
        match completion {
            SendCompletion::PushAck(ack) => self.on_push_ack(ack),
            SendCompletion::AckTimeout { client_id } => self.on_ack_timeout(client_id),
            SendCompletion::Fallback { client_id, result } => {
                self.on_fallback_result(client_id, result)
            }
        }
    }

    pub fn phase(&self, client_id: &Uuid) -> Option<SendPhase> {
        self.in_flight.get(client_id).map(|entry| entry.phase)
    }

    /// Sends not yet settled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn on_push_ack(&mut self, ack: SendAck) -> Option<SendOutcome> {
        let client_id = ack.client_id;
        match self.in_flight.get_mut(&client_id) {
            Some(entry) if entry.phase == SendPhase::AwaitingAck => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
            _ => {
                debug!("Discarding late push ack for {}", client_id);
                return None;
            }
        }

        match ack.into_result() {
            Ok(message) => {
                self.in_flight.remove(&client_id);
                info!("Send {} acknowledged over push as {}", client_id, message.id);
                Some(SendOutcome::Delivered {
                    client_id,
                    message,
                    path: DeliveryPath::Push,
                })
            }
            Err(reason) => {
                warn!(
                    "Push send {} rejected ({}), falling back to REST",
                    client_id, reason
                );
                self.fall_back(client_id);
                None
            }
        }
    }

    fn on_ack_timeout(&mut self, client_id: Uuid) -> Option<SendOutcome> {
        match self.in_flight.get_mut(&client_id) {
            Some(entry) if entry.phase == SendPhase::AwaitingAck => {
                entry.timer = None;
            }
            _ => return None,
        }
        // The push request stays outstanding; its ack will be discarded
        warn!(
            "No push ack for {} within {:?}, falling back to REST",
            client_id, self.ack_timeout
        );
        self.fall_back(client_id);
        None
    }

    fn on_fallback_result(
        &mut self,
        client_id: Uuid,
        result: Result<Message, ChatError>,
    ) -> Option<SendOutcome> {
        if self.phase(&client_id) != Some(SendPhase::FallingBack) {
            debug!("Discarding fallback result for settled send {}", client_id);
            return None;
        }
        let entry = self.in_flight.remove(&client_id)?;
        match result {
            Ok(message) => {
                info!("Send {} stored over REST as {}", client_id, message.id);
                Some(SendOutcome::Delivered {
                    client_id,
                    message,
                    path: DeliveryPath::Fallback,
                })
            }
            Err(error) => {
                warn!("Send {} failed on both paths: {}", client_id, error);
                Some(SendOutcome::Failed {
                    client_id,
                    draft: entry.draft,
                    error,
                })
            }
        }
    }

    fn fall_back(&mut self, client_id: Uuid) {
        let draft = match self.in_flight.get_mut(&client_id) {
            Some(entry) => {
                entry.phase = SendPhase::FallingBack;
                entry.draft.clone()
            }
            None => return,
        };
        self.spawn_fallback(client_id, draft);
    }

    fn spawn_ack_timer(&self, client_id: Uuid) -> AbortHandle {
        let completions = self.completions.clone();
        let wait = self.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = completions.send(SendCompletion::AckTimeout { client_id });
        })
        .abort_handle()
    }

    fn spawn_fallback(&self, client_id: Uuid, draft: OutgoingMessage) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = api
                .create_message(
                    &draft.conversation_id,
                    draft.content.trim(),
                    draft.message_type,
                )
                .await;
            let _ = completions.send(SendCompletion::Fallback { client_id, result });
        });
    }
}

impl Drop for DeliveryProtocol {
    fn drop(&mut self) {
        for entry in self.in_flight.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}
