//! Inbound command pipeline: parse, gate, route.
//!
//! Every message goes through the same steps:
//!
//! 1. Parse the payload as a JSON object.
//! 2. `authorize` the envelope's selection policy, then `verify` its signature.
//! 3. Extract the command's parameters.
//! 4. Spawn a task to do the work.
//!
//! Anything that fails steps 1-3 is dropped with a debug log and never
//! answered. The spawned task owns all further failure handling: probe errors
//! land in result records, module errors and panics are logged.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{authorize, AuthType, SignatureVerifier};
use crate::control::{ControlBus, ControlEvent};
use crate::loadtest::{LoadTestRun, LoadTestRunner};
use crate::metrics::{COMMANDS_RECEIVED, COMMANDS_REJECTED, TASK_FAILURES};
use crate::request_timer::{RequestConfig, RequestTimer, ResponseRecord};
use crate::tasks::{TaskRegistry, HOST_MONITORING};
use crate::topics::{is_topic_level, manage_topic_run_id, TopicScheme};
use crate::transport::{publish_json, Transport};

/// Task id used when a command carries none.
pub const DEFAULT_TASK_ID: &str = "default";

/// Commands the agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LoadTest,
    ManageLoadTest,
    EndpointHealth,
    HostMonitoring,
    CustomCommand,
    Execute,
    SubscribeTopic,
    UnsubscribeTopic,
    SetTime,
}

impl Command {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "loadtest" => Command::LoadTest,
            "manageloadtest" => Command::ManageLoadTest,
            "endpointhealth" => Command::EndpointHealth,
            "hostmonitoring" => Command::HostMonitoring,
            "customcommand" => Command::CustomCommand,
            "execute" => Command::Execute,
            "subscribetopic" => Command::SubscribeTopic,
            "unsubscribetopic" => Command::UnsubscribeTopic,
            "settime" => Command::SetTime,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::LoadTest => "loadtest",
            Command::ManageLoadTest => "manageloadtest",
            Command::EndpointHealth => "endpointhealth",
            Command::HostMonitoring => "hostmonitoring",
            Command::CustomCommand => "customcommand",
            Command::Execute => "execute",
            Command::SubscribeTopic => "subscribetopic",
            Command::UnsubscribeTopic => "unsubscribetopic",
            Command::SetTime => "settime",
        }
    }
}

/// Work extracted from an accepted envelope.
#[derive(Debug, Clone)]
enum Job {
    LoadTest(LoadTestRun),
    Control {
        run_id: String,
        event: ControlEvent,
    },
    EndpointHealth {
        id: String,
        requests: Vec<RequestConfig>,
    },
    Task {
        command: Command,
        module: String,
        id: String,
        arguments: Value,
    },
    Subscribe(String),
    Unsubscribe(String),
    SetTime(i64),
}

#[derive(Serialize)]
struct HealthResult<'a> {
    id: &'a str,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    #[serde(rename = "ResponsesData")]
    responses_data: &'a [ResponseRecord],
}

#[derive(Serialize)]
struct TaskResult<'a> {
    id: &'a str,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    command: &'a str,
    #[serde(rename = "ReturnValue")]
    return_value: Value,
}

/// A string field, also accepting numbers.
fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A text field that becomes one level of an outbound or control topic.
/// `Some(None)` when absent, `None` when present but not a single level.
fn level_field(map: &Map<String, Value>, key: &str) -> Option<Option<String>> {
    match text_field(map, key) {
        Some(value) if !is_topic_level(&value) => None,
        other => Some(other),
    }
}

fn integer_field(map: &Map<String, Value>, key: &str) -> Option<i64> {
    match map.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn requests_field(map: &Map<String, Value>) -> Option<Vec<RequestConfig>> {
    match map.get("requests") {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(requests) => Some(requests),
            Err(e) => {
                debug!(error = %e, "Malformed requests list");
                None
            }
        },
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    verifier: Arc<SignatureVerifier>,
    bus: ControlBus,
    runner: LoadTestRunner,
    timer: RequestTimer,
    tasks: TaskRegistry,
    topics: TopicScheme,
    node_options: Value,
}

/// Routes authorized commands to their handlers. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        verifier: Arc<SignatureVerifier>,
        bus: ControlBus,
        timer: RequestTimer,
        tasks: TaskRegistry,
        topics: TopicScheme,
        node_options: Value,
    ) -> Self {
        let runner = LoadTestRunner::new(
            Arc::clone(&transport),
            bus.clone(),
            timer.clone(),
            topics.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                transport,
                verifier,
                bus,
                runner,
                timer,
                tasks,
                topics,
                node_options,
            }),
        }
    }

    pub fn verifier(&self) -> &Arc<SignatureVerifier> {
        &self.inner.verifier
    }

    pub fn bus(&self) -> &ControlBus {
        &self.inner.bus
    }

    /// Handle one inbound message.
    ///
    /// Returns the spawned task's handle when the message was accepted, and
    /// `None` when it was dropped.
    pub fn on_message(&self, topic: &str, payload: &[u8]) -> Option<JoinHandle<()>> {
        let envelope = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return reject("malformed", topic, "payload is not a JSON object"),
            Err(_) => return reject("malformed", topic, "payload is not JSON"),
        };

        let auth_type = AuthType::parse(
            envelope
                .get("authtype")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );
        let auth_data = envelope.get("authdata").cloned().unwrap_or(Value::Null);
        if !authorize(&auth_type, &auth_data) {
            return reject("unauthorized", topic, "not selected by authtype");
        }
        let signature = envelope
            .get("signature")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !self.inner.verifier.verify(signature) {
            return reject("bad_signature", topic, "signature rejected");
        }

        let raw_command = envelope
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(command) = Command::parse(raw_command) else {
            return reject("unknown_command", topic, "unknown command");
        };
        let Some(job) = self.extract(command, topic, &envelope) else {
            return reject("malformed", topic, "missing or invalid command fields");
        };

        COMMANDS_RECEIVED.with_label_values(&[command.as_str()]).inc();
        debug!(topic = %topic, command = command.as_str(), "Command accepted");

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            let work = tokio::spawn(async move { inner.run(job).await });
            if let Err(e) = work.await {
                if e.is_panic() {
                    error!(command = command.as_str(), "Command handler panicked");
                    TASK_FAILURES.with_label_values(&[command.as_str()]).inc();
                }
            }
        }))
    }

    fn extract(&self, command: Command, topic: &str, envelope: &Map<String, Value>) -> Option<Job> {
        let task_id = || {
            level_field(envelope, "id").map(|id| id.unwrap_or_else(|| DEFAULT_TASK_ID.to_string()))
        };
        match command {
            Command::LoadTest => Some(Job::LoadTest(LoadTestRun {
                uuid: level_field(envelope, "uuid")?,
                id: level_field(envelope, "id")??,
                requests: requests_field(envelope)?,
                iterate_until_ts: envelope.get("iterateUntilTs").and_then(Value::as_f64),
            })),
            Command::ManageLoadTest => Some(Job::Control {
                run_id: manage_topic_run_id(topic)?.to_string(),
                event: ControlEvent {
                    action: envelope
                        .get("action")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
            }),
            Command::EndpointHealth => Some(Job::EndpointHealth {
                id: task_id()?,
                requests: requests_field(envelope)?,
            }),
            Command::HostMonitoring => Some(Job::Task {
                command,
                module: HOST_MONITORING.to_string(),
                id: task_id()?,
                arguments: envelope.get("arguments").cloned().unwrap_or(Value::Null),
            }),
            Command::CustomCommand | Command::Execute => Some(Job::Task {
                command,
                module: text_field(envelope, "module")?,
                id: task_id()?,
                arguments: envelope.get("arguments").cloned().unwrap_or(Value::Null),
            }),
            Command::SubscribeTopic => {
                let fragment = envelope.get("topic").and_then(Value::as_str)?;
                Some(Job::Subscribe(self.inner.topics.wildcard(fragment)?))
            }
            Command::UnsubscribeTopic => {
                let fragment = envelope.get("topic").and_then(Value::as_str)?;
                Some(Job::Unsubscribe(self.inner.topics.wildcard(fragment)?))
            }
            Command::SetTime => Some(Job::SetTime(integer_field(envelope, "time")?)),
        }
    }
}

fn reject(reason: &'static str, topic: &str, detail: &str) -> Option<JoinHandle<()>> {
    COMMANDS_REJECTED.with_label_values(&[reason]).inc();
    debug!(topic = %topic, reason, detail, "Dropped inbound message");
    None
}

impl Inner {
    async fn run(&self, job: Job) {
        match job {
            Job::LoadTest(run) => {
                self.runner.run(run).await;
            }
            Job::Control { run_id, event } => {
                let delivered = self.bus.signal(&run_id, &event);
                debug!(run_id = %run_id, delivered, "Control event routed");
            }
            Job::EndpointHealth { id, requests } => self.endpoint_health(&id, &requests).await,
            Job::Task {
                command,
                module,
                id,
                arguments,
            } => self.run_task(command, &module, &id, &arguments).await,
            Job::Subscribe(topic) => match self.transport.subscribe(&topic).await {
                Ok(()) => info!(topic = %topic, "Subscribed"),
                Err(e) => warn!(topic = %topic, error = %e, "Subscribe failed"),
            },
            Job::Unsubscribe(topic) => match self.transport.unsubscribe(&topic).await {
                Ok(()) => info!(topic = %topic, "Unsubscribed"),
                Err(e) => warn!(topic = %topic, error = %e, "Unsubscribe failed"),
            },
            Job::SetTime(time_ms) => {
                self.verifier.calibrate(time_ms);
            }
        }
    }

    async fn endpoint_health(&self, id: &str, requests: &[RequestConfig]) {
        let topic = self
            .topics
            .task_results(Command::EndpointHealth.as_str(), id);
        for request in requests {
            let record = self.timer.execute(request).await;
            let result = HealthResult {
                id,
                agent_id: self.topics.agent_id(),
                responses_data: std::slice::from_ref(&record),
            };
            publish_json(self.transport.as_ref(), &topic, &result).await;
        }
    }

    async fn run_task(&self, command: Command, module: &str, id: &str, arguments: &Value) {
        let outcome = self
            .tasks
            .invoke(module, &self.node_options, arguments)
            .await;
        let value = match outcome {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                warn!(command = command.as_str(), module = %module, error = %e, "Task module failed");
                TASK_FAILURES.with_label_values(&[command.as_str()]).inc();
                return;
            }
            None => {
                warn!(command = command.as_str(), module = %module, "No task module registered under this name");
                TASK_FAILURES.with_label_values(&[command.as_str()]).inc();
                return;
            }
        };
        let result = TaskResult {
            id,
            agent_id: self.topics.agent_id(),
            command: command.as_str(),
            return_value: value,
        };
        publish_json(
            self.transport.as_ref(),
            &self.topics.task_results(command.as_str(), id),
            &result,
        )
        .await;
    }
}
