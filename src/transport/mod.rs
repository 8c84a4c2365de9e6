//! Publish/subscribe transport port.
//!
//! The agent core only needs three operations from its transport plus a
//! stream of inbound events; connection management, reconnects and backoff
//! belong to the implementation.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;

pub use memory::{MemoryBroker, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Something that arrived from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message published on a topic this client is subscribed to.
    Message { topic: String, payload: Vec<u8> },
    /// The broker saw another session with this client's identity.
    DuplicateSession,
}

/// Errors surfaced by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An already-connected publish/subscribe client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Publish a JSON value, logging rather than propagating failures.
///
/// Results are best-effort: a failed publish is not retried and never
/// interrupts the task that produced it.
pub async fn publish_json<T: serde::Serialize + ?Sized>(
    transport: &dyn Transport,
    topic: &str,
    value: &T,
) -> bool {
    let payload = match serde_json::to_vec(value) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "Failed to encode result");
            return false;
        }
    };
    match transport.publish(topic, payload).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "Failed to publish");
            false
        }
    }
}
