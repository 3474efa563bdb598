/// REST client for the fallback channel and the user directory
use crate::error::{ChatError, Result};
use crate::types::{ChatUser, Conversation, Message, MessagePage, MessageType};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Request/response operations of the chat backend
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    async fn get_or_create_conversation(&self, other_user_id: &str) -> Result<Conversation>;

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<MessagePage>;

    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message>;

    async fn mark_read(&self, message_id: &str) -> Result<()>;

    async fn list_chat_eligible_users(&self, search: Option<&str>) -> Result<Vec<ChatUser>>;
}

/// API response envelope
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    other_user_id: &'a str,
}

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    content: &'a str,
    #[serde(rename = "type")]
    message_type: MessageType,
}

/// `ChatApi` over HTTP with a bearer session token
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpChatApi {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send and unwrap the envelope, requiring `data`
    async fn fetch<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let envelope = self.send::<T>(request).await?;
        envelope
            .data
            .ok_or_else(|| ChatError::Api {
                status: StatusCode::OK.as_u16(),
                message: "response carried no data".to_string(),
            })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse<T>> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!("Chat API rejected session token ({})", status);
            return Err(ChatError::Unauthorized(format!("server answered {}", status)));
        }

        let body = response.bytes().await.map_err(classify)?;
        match serde_json::from_slice::<ApiResponse<T>>(&body) {
            Ok(envelope) if status.is_success() && envelope.success => Ok(envelope),
            Ok(envelope) => Err(ChatError::Api {
                status: status.as_u16(),
                message: envelope
                    .error
                    .unwrap_or_else(|| "request failed".to_string()),
            }),
            Err(e) if status.is_success() => Err(ChatError::Serialization(e)),
            Err(_) => Err(ChatError::Api {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            }),
        }
    }
}

/// Transport timeouts get their own variant
fn classify(error: reqwest::Error) -> ChatError {
    if error.is_timeout() {
        ChatError::Timeout(error.to_string())
    } else {
        ChatError::Http(error)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        debug!("GET /chat/conversations");
        self.fetch(self.client.get(self.url("/chat/conversations")))
            .await
    }

    async fn get_or_create_conversation(&self, other_user_id: &str) -> Result<Conversation> {
        debug!("POST /chat/conversations for {}", other_user_id);
        let body = CreateConversationRequest { other_user_id };
        self.fetch(self.client.post(self.url("/chat/conversations")).json(&body))
            .await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<MessagePage> {
        let path = format!(
            "/chat/conversations/{}/messages",
            urlencoding::encode(conversation_id)
        );
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        self.fetch(self.client.get(self.url(&path)).query(&query))
            .await
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let path = format!(
            "/chat/conversations/{}/messages",
            urlencoding::encode(conversation_id)
        );
        let body = CreateMessageRequest {
            content,
            message_type,
        };
        self.fetch(self.client.post(self.url(&path)).json(&body))
            .await
    }

    async fn mark_read(&self, message_id: &str) -> Result<()> {
        let path = format!("/chat/messages/{}/read", urlencoding::encode(message_id));
        self.send::<serde_json::Value>(self.client.patch(self.url(&path)))
            .await
            .map(|_| ())
    }

    async fn list_chat_eligible_users(&self, search: Option<&str>) -> Result<Vec<ChatUser>> {
        let mut request = self.client.get(self.url("/chat/users"));
        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            request = request.query(&[("search", term)]);
        }
        self.fetch(request).await
    }
}
