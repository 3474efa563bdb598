/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000/api";
const PUSH_PATH: &str = "/chat/ws";

/// Chat core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST API (fallback channel)
    pub base_url: String,

    /// WebSocket URL of the push channel (derived from `base_url` when unset)
    pub push_url: Option<String>,

    /// How long a push send waits for its ack before falling back to REST
    pub send_ack_timeout: Duration,

    /// Automatic reconnect attempts after a connection loss
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Transport timeout for REST calls
    pub request_timeout: Duration,

    /// Page size for message history requests
    pub page_size: usize,

    /// Id of the signed-in user (only used by the standalone binary)
    pub self_user_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            push_url: None,
            send_ack_timeout: Duration::from_millis(3000),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            page_size: 50,
            self_user_id: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(ChatError::Config(format!(
                "Usage: {} <base_url> [--push-url <url>] [--user-id <id>]",
                args.first().map(String::as_str).unwrap_or("schoolchat")
            )));
        }

        let mut config = Config {
            base_url: normalize_base_url(&args[1])?,
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--push-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--push-url requires a URL argument".to_string())
                    })?;
                    config.push_url = Some(url.clone());
                    i += 2;
                }
                "--user-id" => {
                    let id = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--user-id requires an id argument".to_string())
                    })?;
                    config.self_user_id = Some(id.clone());
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Environment overrides (handy for deployments)
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("CHAT_BASE_URL") {
            self.base_url = normalize_base_url(&url)?;
        }
        if let Ok(url) = std::env::var("CHAT_PUSH_URL") {
            self.push_url = Some(url);
        }
        if let Ok(ms) = std::env::var("CHAT_ACK_TIMEOUT_MS") {
            let ms = ms.parse::<u64>().map_err(|_| {
                ChatError::Config("CHAT_ACK_TIMEOUT_MS must be a number of milliseconds".to_string())
            })?;
            self.send_ack_timeout = Duration::from_millis(ms);
        }
        if let Ok(n) = std::env::var("CHAT_RECONNECT_ATTEMPTS") {
            self.reconnect_attempts = n.parse::<u32>().map_err(|_| {
                ChatError::Config("CHAT_RECONNECT_ATTEMPTS must be a number".to_string())
            })?;
        }
        if let Ok(id) = std::env::var("CHAT_USER_ID") {
            self.self_user_id = Some(id);
        }
        Ok(())
    }

    /// Push channel URL: explicit value, or the base URL on ws(s) + `/chat/ws`
    pub fn push_url(&self) -> String {
        if let Some(url) = &self.push_url {
            return url.clone();
        }
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}{}", ws_base, PUSH_PATH)
    }
}

fn normalize_base_url(url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ChatError::Config(format!(
            "Base URL must start with http:// or https://, got {:?}",
            url
        )));
    }
    Ok(trimmed.to_string())
}
