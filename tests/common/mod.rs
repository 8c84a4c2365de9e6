#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};

use fleet_agent::auth::{seal, SignatureVerifier};
use fleet_agent::transport::{Transport, TransportError};
use fleet_agent::utils::now_epoch_ms;

/// One call made against a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Publish { topic: String, payload: Value },
    Subscribe(String),
    Unsubscribe(String),
}

/// Transport that remembers every call. Subscribes to topics listed in
/// `fail_subscribe` fail with `Closed`.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    ops: Arc<Mutex<Vec<Op>>>,
    fail_subscribe: Arc<Mutex<Vec<String>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subscribe_to(&self, topic: &str) {
        self.fail_subscribe.lock().unwrap().push(topic.to_string());
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Publish { topic: t, payload } if t == topic => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Op) -> usize {
        self.ops().iter().filter(|op| *op == wanted).count()
    }

    pub fn position(&self, wanted: &Op) -> Option<usize> {
        self.ops().iter().position(|op| op == wanted)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let payload: Value = serde_json::from_slice(&payload)?;
        self.ops.lock().unwrap().push(Op::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if self.fail_subscribe.lock().unwrap().iter().any(|t| t == topic) {
            return Err(TransportError::Closed);
        }
        self.ops.lock().unwrap().push(Op::Subscribe(topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ops
            .lock()
            .unwrap()
            .push(Op::Unsubscribe(topic.to_string()));
        Ok(())
    }
}

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn verifier() -> Arc<SignatureVerifier> {
    Arc::new(SignatureVerifier::new(signing_key().verifying_key(), 0))
}

/// A signature stamped with the current time.
pub fn fresh_signature() -> String {
    seal(&signing_key(), &format!("fleet-controller|{}", now_epoch_ms()))
}

/// Wrap command fields in an `all`-authorized, freshly signed envelope.
pub fn envelope(fields: Value) -> Vec<u8> {
    let mut map = match fields {
        Value::Object(map) => map,
        _ => panic!("envelope fields must be an object"),
    };
    map.insert("authtype".to_string(), json!("all"));
    map.insert("authdata".to_string(), Value::Null);
    map.insert("signature".to_string(), json!(fresh_signature()));
    serde_json::to_vec(&Value::Object(map)).unwrap()
}
