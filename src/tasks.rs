//! Pluggable task modules.
//!
//! Commands such as `hostmonitoring`, `customcommand` and `execute` run a
//! named module out of a [`TaskRegistry`]. A fresh module instance is built
//! per invocation and driven through the same sequence every time:
//!
//! 1. `set_node_options` with the agent's configuration
//! 2. `set_arguments` with the command's `arguments` field
//! 3. `run`, whose value becomes the published result
//!
//! Modules are compiled in and registered by name; there is no loading from
//! arbitrary paths.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

/// Failure reported by a task module.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("task failed: {0}")]
    Failed(String),
}

/// A unit of work the dispatcher can run on behalf of a command.
#[async_trait]
pub trait TaskModule: Send {
    /// Receives the agent's configuration before anything else.
    fn set_node_options(&mut self, _options: &Value) {}

    /// Receives the command's `arguments` field (null when absent).
    fn set_arguments(&mut self, _arguments: &Value) -> Result<(), TaskError> {
        Ok(())
    }

    async fn run(&mut self) -> Result<Value, TaskError>;
}

/// Builds a fresh module instance per invocation.
pub type TaskFactory = Arc<dyn Fn() -> Box<dyn TaskModule> + Send + Sync>;

/// Name → module factory.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the modules that ship with the agent.
    pub fn with_builtin_modules() -> Self {
        let mut registry = Self::new();
        registry.register(HOST_MONITORING, || Box::new(HostMonitor::default()));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn TaskModule> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build and run a module end to end.
    ///
    /// Returns `None` when no module is registered under `name`.
    pub async fn invoke(
        &self,
        name: &str,
        node_options: &Value,
        arguments: &Value,
    ) -> Option<Result<Value, TaskError>> {
        let factory = self.factories.get(name)?;
        let mut module = factory();
        module.set_node_options(node_options);
        if let Err(e) = module.set_arguments(arguments) {
            return Some(Err(e));
        }
        Some(module.run().await)
    }
}

/// Registry name of the built-in host monitor.
pub const HOST_MONITORING: &str = "hostmonitoring";

/// Reports agent and host resource usage.
///
/// On Linux this reads `/proc`; elsewhere only the agent id and platform are
/// reported.
#[derive(Debug, Default)]
pub struct HostMonitor {
    agent_id: Option<String>,
}

#[async_trait]
impl TaskModule for HostMonitor {
    fn set_node_options(&mut self, options: &Value) {
        self.agent_id = options
            .get("agentId")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    async fn run(&mut self) -> Result<Value, TaskError> {
        let mut report = json!({
            "agentId": self.agent_id,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        });
        if let (Some(report), Some(host)) = (report.as_object_mut(), host_stats()) {
            report.extend(host);
        }
        Ok(report)
    }
}

#[cfg(target_os = "linux")]
fn host_stats() -> Option<serde_json::Map<String, Value>> {
    use procfs::process::Process;
    use procfs::Current;

    let mut stats = serde_json::Map::new();

    match Process::myself().and_then(|me| me.stat()) {
        Ok(stat) => {
            stats.insert("processRssBytes".to_string(), json!(stat.rss * procfs::page_size()));
        }
        Err(e) => tracing::debug!(error = %e, "Failed to read /proc/self/stat"),
    }

    match procfs::LoadAverage::current() {
        Ok(load) => {
            stats.insert(
                "loadAverage".to_string(),
                json!([load.one, load.five, load.fifteen]),
            );
        }
        Err(e) => tracing::debug!(error = %e, "Failed to read /proc/loadavg"),
    }

    match procfs::Meminfo::current() {
        Ok(mem) => {
            stats.insert("memTotalBytes".to_string(), json!(mem.mem_total));
            stats.insert("memFreeBytes".to_string(), json!(mem.mem_free));
            stats.insert("memAvailableBytes".to_string(), json!(mem.mem_available));
        }
        Err(e) => tracing::debug!(error = %e, "Failed to read /proc/meminfo"),
    }

    Some(stats)
}

#[cfg(not(target_os = "linux"))]
fn host_stats() -> Option<serde_json::Map<String, Value>> {
    None
}
