use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use super::manager::{Credential, PushConnector, PushLink};
use super::protocol::{ClientCommand, ServerEvent};
use super::ChannelError;

/// Push transport over a websocket carrying one JSON object per text frame.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(&self, credential: &Credential) -> Result<PushLink, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|e| ChannelError::Connect(format!("invalid token: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        debug!("Websocket handshake with {} ({})", self.url, response.status());

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                let frame = match serde_json::to_string(&command) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", command.name(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                    debug!("Websocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) => break,
                    // Pings are answered by tungstenite itself
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Websocket read failed: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if inbound_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!("Ignoring unrecognized push frame: {} ({})", text, e),
                }
            }
            // Dropping inbound_tx signals the loss to the channel manager
        });

        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
