//! In-process broker for embedding several agents in one process and for tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent};
use crate::topics::topic_matches;

struct Session {
    id: u64,
    filters: BTreeSet<String>,
    inbox: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    sessions: Vec<Session>,
}

/// Routes publishes to every session whose filters match, MQTT style.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new session on the broker.
    pub fn connect(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.sessions.push(Session {
            id,
            filters: BTreeSet::new(),
            inbox: tx,
        });
        (
            MemoryTransport {
                broker: self.clone(),
                session_id: id,
            },
            rx,
        )
    }

    /// Filters currently held by a session.
    pub fn subscriptions(&self, transport: &MemoryTransport) -> Vec<String> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.id == transport.session_id)
            .map(|s| s.filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Push an event straight into a session's inbox, bypassing routing.
    pub fn notify(&self, transport: &MemoryTransport, event: TransportEvent) {
        if let Some(session) = self
            .lock()
            .sessions
            .iter()
            .find(|s| s.id == transport.session_id)
        {
            let _ = session.inbox.send(event);
        }
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        let mut state = self.lock();
        // Sessions whose receiver was dropped are pruned on the way.
        state.sessions.retain(|session| {
            if !session.filters.iter().any(|f| topic_matches(f, topic)) {
                return !session.inbox.is_closed();
            }
            session
                .inbox
                .send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok()
        });
    }

    fn update_filters(
        &self,
        session_id: u64,
        update: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or(TransportError::Closed)?;
        update(&mut session.filters);
        Ok(())
    }
}

/// One session on a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    session_id: u64,
}

fn check_topic(topic: &str) -> Result<(), TransportError> {
    if topic.is_empty() {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        check_topic(topic)?;
        if topic.contains(['+', '#']) {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        self.broker.route(topic, &payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        check_topic(topic)?;
        self.broker.update_filters(self.session_id, |filters| {
            filters.insert(topic.to_string());
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        check_topic(topic)?;
        self.broker.update_filters(self.session_id, |filters| {
            filters.remove(topic);
        })
    }
}
