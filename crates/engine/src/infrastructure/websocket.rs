//! WebSocket transport to the remote commerce service using tokio-tungstenite

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use storesync_shared::{encode_client_message, parse_server_message, ClientMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::infrastructure::ports::{ConnectionError, Transport, TransportChannel};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

pub struct WebSocketTransport {
    endpoint: String,
}

impl WebSocketTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportChannel, ConnectionError> {
        let (ws_stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(ConnectionError::network)?;
        tracing::info!(endpoint = %self.endpoint, "WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let item = match frame {
                    Ok(Message::Text(text)) => match parse_server_message(&text) {
                        Ok(message) => Ok(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to parse server message");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "Remote closed the WebSocket");
                        break;
                    }
                    // tungstenite answers pings itself
                    Ok(_) => continue,
                    Err(e) => Err(ConnectionError::network(e)),
                };

                let failed = item.is_err();
                if inbound_tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            tracing::debug!("WebSocket read task finished");
        });

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let json = match encode_client_message(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize client message");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    tracing::error!(error = %e, "Failed to send WebSocket message");
                    break;
                }
            }
            // Every sender is gone: the session is over
            let _ = write.close().await;
            tracing::debug!("WebSocket write task finished");
        });

        Ok(TransportChannel { outbound, inbound })
    }
}
