/// WebSocket transport for the push channel
use crate::error::{ChatError, Result};
use crate::push::connection::{PushConnector, PushLink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Connects to the chat push endpoint with a bearer token
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, token: &str) -> Result<PushLink> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ChatError::Config("Session token is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, _response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(WsError::Http(response)) if matches!(response.status().as_u16(), 401 | 403) => {
                return Err(ChatError::Unauthorized(format!(
                    "push handshake rejected with {}",
                    response.status()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        debug!("WebSocket handshake with {} complete", self.url);

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("WebSocket closed by server: {:?}", frame);
                        break;
                    }
                    // Ping/pong is answered by tungstenite; binary frames are not part of the contract
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
