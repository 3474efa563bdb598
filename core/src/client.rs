/// Client entry point: login builds a session, logout tears it down
use crate::api::{ChatApi, HttpChatApi};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::push::{PushConnector, WsConnector};
use crate::session::{ChatSession, SessionHandle};
use std::sync::Arc;
use tracing::info;

/// Session token plus the id of the user it belongs to
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
    pub user_id: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

/// Builds the two transports for a session
pub trait TransportFactory: Send + Sync {
    fn api(&self, credentials: &Credentials) -> Result<Arc<dyn ChatApi>>;
    fn connector(&self) -> Result<Arc<dyn PushConnector>>;
}

/// HTTP + WebSocket transports from the configured URLs
pub struct HttpTransports {
    config: Config,
}

impl HttpTransports {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl TransportFactory for HttpTransports {
    fn api(&self, credentials: &Credentials) -> Result<Arc<dyn ChatApi>> {
        let api = HttpChatApi::new(
            &self.config.base_url,
            credentials.token.clone(),
            self.config.request_timeout,
        )?;
        Ok(Arc::new(api))
    }

    fn connector(&self) -> Result<Arc<dyn PushConnector>> {
        Ok(Arc::new(WsConnector::new(self.config.push_url())))
    }
}

pub struct ChatClient {
    config: Config,
    transports: Box<dyn TransportFactory>,
    session: Option<SessionHandle>,
}

impl ChatClient {
    pub fn new(config: Config) -> Self {
        let transports = Box::new(HttpTransports::new(config.clone()));
        Self::with_transports(config, transports)
    }

    pub fn with_transports(config: Config, transports: Box<dyn TransportFactory>) -> Self {
        Self {
            config,
            transports,
            session: None,
        }
    }

    /// Start a session for `credentials`, replacing any previous one
    pub async fn login(&mut self, credentials: Credentials) -> Result<SessionHandle> {
        if credentials.token.trim().is_empty() {
            return Err(ChatError::Unauthorized("missing session token".to_string()));
        }
        self.logout().await;

        let api = self.transports.api(&credentials)?;
        let connector = self.transports.connector()?;
        info!("Logging in as {}", credentials.user_id);
        let session = ChatSession::start(
            &self.config,
            credentials.user_id,
            &credentials.token,
            api,
            connector,
        );
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Stop the current session, if any
    pub async fn logout(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Logging out {}", session.user_id());
            session.shutdown().await;
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }
}
