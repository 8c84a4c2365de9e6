//! In-process control signalling for running load tests.
//!
//! Each load-test run with a control binding registers a handler under its
//! run id for as long as it executes. Control messages arriving on the run's
//! manage topic are routed here by the dispatcher and fanned out to whatever
//! is registered under that id. Signals for ids with nothing registered
//! (unknown runs, runs that already finished) are dropped silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A control message delivered to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Requested action; `halt` is the only one runs act on today.
    #[serde(default)]
    pub action: Option<String>,
}

impl ControlEvent {
    pub fn halt() -> Self {
        Self {
            action: Some("halt".to_string()),
        }
    }

    pub fn is_halt(&self) -> bool {
        self.action.as_deref() == Some("halt")
    }
}

/// Receives control events for one registered run.
pub trait ControlHandler: Send + Sync {
    fn on_event(&self, run_id: &str, event: &ControlEvent);
}

type Registry = HashMap<String, Vec<Arc<dyn ControlHandler>>>;

/// Shared registry of run id → handlers. Cheap to clone.
#[derive(Clone, Default)]
pub struct ControlBus {
    handlers: Arc<Mutex<Registry>>,
}

impl ControlBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, run_id: &str, handler: Arc<dyn ControlHandler>) {
        debug!(run_id = %run_id, "Control handler registered");
        self.lock()
            .entry(run_id.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove one handler, matched by identity. Returns whether it was found.
    pub fn unregister(&self, run_id: &str, handler: &Arc<dyn ControlHandler>) -> bool {
        let mut registry = self.lock();
        let Some(handlers) = registry.get_mut(run_id) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.remove(run_id);
        }
        if removed {
            debug!(run_id = %run_id, "Control handler unregistered");
        }
        removed
    }

    /// Deliver an event to every handler registered under `run_id`.
    /// Returns how many handlers received it.
    pub fn signal(&self, run_id: &str, event: &ControlEvent) -> usize {
        // Handlers run outside the lock so they may call back into the bus.
        let handlers: Vec<_> = match self.lock().get(run_id) {
            Some(handlers) => handlers.clone(),
            None => {
                debug!(run_id = %run_id, "Control event for unknown run dropped");
                return 0;
            }
        };
        for handler in &handlers {
            handler.on_event(run_id, event);
        }
        handlers.len()
    }

    /// Halt every registered run. Used on shutdown.
    pub fn halt_all(&self) -> usize {
        let event = ControlEvent::halt();
        self.active_runs()
            .iter()
            .map(|run_id| self.signal(run_id, &event))
            .sum()
    }

    /// Ids with at least one registered handler.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
