//! Agent lifecycle: announce, dispatch until told to stop, then shut down
//! cleanly.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::instance_lock::InstanceLock;
use crate::topics::TopicScheme;
use crate::transport::{publish_json, Transport, TransportError, TransportEvent};

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The caller's shutdown future resolved (SIGINT/SIGTERM in the binary).
    Requested,
    /// The broker reported another session under this agent's identity.
    DuplicateSession,
    /// The transport's event stream ended.
    TransportClosed,
}

pub struct Agent {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatcher: Dispatcher,
    topics: TopicScheme,
    shutdown_grace: Duration,
    lock: Option<InstanceLock>,
}

impl Agent {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        dispatcher: Dispatcher,
        topics: TopicScheme,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            transport,
            events,
            dispatcher,
            topics,
            shutdown_grace,
            lock: None,
        }
    }

    /// Hold `lock` until shutdown completes.
    pub fn with_lock(mut self, lock: InstanceLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Run until `shutdown` resolves, a duplicate session is reported, or
    /// the transport closes. Only the initial subscriptions can fail.
    pub async fn run<F>(mut self, shutdown: F) -> Result<ShutdownReason, TransportError>
    where
        F: Future<Output = ()>,
    {
        self.transport.subscribe(&self.topics.broadcast()).await?;
        self.transport.subscribe(&self.topics.direct()).await?;
        self.announce("online").await;
        info!(agent_id = %self.topics.agent_id(), "Agent online");

        tokio::pin!(shutdown);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => break ShutdownReason::Requested,
                event = self.events.recv() => match event {
                    Some(TransportEvent::Message { topic, payload }) => {
                        in_flight.retain(|h| !h.is_finished());
                        if let Some(handle) = self.dispatcher.on_message(&topic, &payload) {
                            in_flight.push(handle);
                        }
                    }
                    Some(TransportEvent::DuplicateSession) => {
                        warn!("Another session is using this agent id");
                        break ShutdownReason::DuplicateSession;
                    }
                    None => break ShutdownReason::TransportClosed,
                },
            }
        };

        self.shutdown(reason, in_flight).await;
        Ok(reason)
    }

    async fn shutdown(&mut self, reason: ShutdownReason, in_flight: Vec<JoinHandle<()>>) {
        info!(reason = ?reason, "Agent shutting down");

        let halted = self.dispatcher.bus().halt_all();
        debug!(halted, "Halt sent to active runs");

        let pending: Vec<_> = in_flight.into_iter().filter(|h| !h.is_finished()).collect();
        let count = pending.len();
        if count > 0 {
            if tokio::time::timeout(self.shutdown_grace, join_all(pending))
                .await
                .is_err()
            {
                warn!(
                    handlers = count,
                    grace_secs = self.shutdown_grace.as_secs_f64(),
                    "Handlers still running after shutdown grace period"
                );
            }
        }

        if reason != ShutdownReason::TransportClosed {
            for topic in [self.topics.broadcast(), self.topics.direct()] {
                if let Err(e) = self.transport.unsubscribe(&topic).await {
                    debug!(topic = %topic, error = %e, "Unsubscribe during shutdown failed");
                }
            }
            self.announce("offline").await;
        }

        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
        info!("Agent stopped");
    }

    async fn announce(&self, status: &str) {
        let message = json!({
            "agentId": self.topics.agent_id(),
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
        });
        publish_json(self.transport.as_ref(), &self.topics.status(), &message).await;
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
