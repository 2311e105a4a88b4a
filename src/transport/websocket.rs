// Websocket link to the realtime server.
// Frames are JSON text: {"event": "<name>", "data": <payload>}.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use super::{Connector, Envelope, Link};

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketConnector { url: url.into() }
    }

    /// The server identifies the socket's owner by the `userId` query parameter.
    pub fn url_for(&self, identity: &str) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| anyhow!("Invalid socket URL {}: {}", self.url, e))?;
        url.query_pairs_mut().append_pair("userId", identity);
        Ok(url.into())
    }
}

pub(crate) fn decode_frame(text: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            debug!("Ignoring malformed frame: {}", e);
            None
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, identity: &str) -> Result<Link> {
        let url = self.url_for(identity)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| anyhow!("Websocket connect to {} failed: {}", self.url, e))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Envelope>();

        // Writer: ends when the session drops its sender.
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&envelope) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode '{}' frame: {}", envelope.event, e);
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(tungstenite::Message::Text(json.into())).await {
                    warn!("Websocket write failed: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: dropping `inbound_tx` tells the session the link is gone.
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(tungstenite::Message::Text(text)) => {
                        if let Some(envelope) = decode_frame(text.as_str()) {
                            if inbound_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Websocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link { outbound, inbound })
    }
}
