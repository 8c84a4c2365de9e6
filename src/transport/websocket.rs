//! WebSocket client for a JSON-framed pub/sub relay.
//!
//! Every frame is a JSON text message tagged by `op`:
//!
//! | op            | direction | fields               |
//! |---------------|-----------|----------------------|
//! | `hello`       | out       | `clientId`           |
//! | `publish`     | out       | `topic`, `payload`   |
//! | `subscribe`   | out       | `topic`              |
//! | `unsubscribe` | out       | `topic`              |
//! | `message`     | in        | `topic`, `payload`   |
//! | `duplicate`   | in        | (none)               |
//!
//! The connection is made once; when it drops the inbound event channel
//! closes and the agent shuts down. Reconnecting is left to the supervisor.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Frame {
    Hello {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    Publish {
        topic: String,
        payload: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Message {
        topic: String,
        payload: String,
    },
    Duplicate,
}

impl Frame {
    fn into_event(self) -> Option<TransportEvent> {
        match self {
            Frame::Message { topic, payload } => Some(TransportEvent::Message {
                topic,
                payload: payload.into_bytes(),
            }),
            Frame::Duplicate => Some(TransportEvent::DuplicateSession),
            Frame::Hello { .. }
            | Frame::Publish { .. }
            | Frame::Subscribe { .. }
            | Frame::Unsubscribe { .. } => None,
        }
    }
}

/// Handle for sending frames over an open relay connection. Cheap to clone.
#[derive(Clone)]
pub struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<Message>,
}

impl WebSocketTransport {
    /// Connect to the relay at `url` and announce `client_id`.
    pub async fn connect(
        url: &str,
        client_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (ws, _response) = connect_async(url).await?;
        info!(url = %url, client_id = %client_id, "Connected to pub/sub relay");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Relay write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if let Some(event) = frame.into_event() {
                                if in_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "Ignoring unparseable relay frame"),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Relay read failed");
                        break;
                    }
                }
            }
        });

        let transport = Self { outgoing: out_tx };
        transport.send(&Frame::Hello {
            client_id: client_id.to_string(),
        })?;
        Ok((transport, in_rx))
    }

    fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame)?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(&Frame::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send(&Frame::Subscribe {
            topic: topic.to_string(),
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send(&Frame::Unsubscribe {
            topic: topic.to_string(),
        })
    }
}
