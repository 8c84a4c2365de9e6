//! Load-test runs: repeated batches of timed requests with remote halt.
//!
//! A run moves through `Initializing → Running → (Halting | Completed)`:
//!
//! - **Initializing**: with a `uuid`, subscribe to the run's manage topic and
//!   register a [`HaltFlag`] on the [`ControlBus`]. A failed subscribe
//!   abandons the run before any request is sent.
//! - **Running**: execute `requests` in order, publishing one result per
//!   request. The halt flag is checked before each request; a request already
//!   in flight completes and its result is still published. A pass repeats
//!   while `iterateUntilTs` lies in the future.
//! - **Completed**: unsubscribe and unregister exactly once, whichever way
//!   the loop ended, then publish the run summary.

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control::{ControlBus, ControlEvent, ControlHandler};
use crate::metrics::ACTIVE_LOADTESTS;
use crate::percentiles::{RunSummary, SummaryReport};
use crate::request_timer::{RequestConfig, RequestTimer, ResponseRecord};
use crate::topics::TopicScheme;
use crate::transport::{publish_json, Transport};
use crate::utils::now_epoch_secs;

/// A load-test command's run parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestRun {
    /// Control binding; runs without one cannot be halted remotely.
    #[serde(default)]
    pub uuid: Option<String>,
    /// Results binding.
    pub id: String,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    /// Repeat passes until this epoch-seconds instant.
    #[serde(default)]
    pub iterate_until_ts: Option<f64>,
}

/// Whether another pass should start at `now_secs`.
pub fn should_repeat(iterate_until_ts: Option<f64>, now_secs: f64) -> bool {
    matches!(iterate_until_ts, Some(until) if until > now_secs)
}

/// Halt flag for one run, set through the control bus.
#[derive(Debug, Default)]
pub struct HaltFlag {
    halted: AtomicBool,
}

impl HaltFlag {
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

impl ControlHandler for HaltFlag {
    fn on_event(&self, run_id: &str, event: &ControlEvent) {
        if event.is_halt() {
            info!(run_id = %run_id, "Halt requested");
            self.halted.store(true, Ordering::SeqCst);
        } else {
            info!(run_id = %run_id, action = ?event.action, "Ignoring unsupported control action");
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Control setup failed; nothing was executed.
    Abandoned,
    Finished(SummaryReport),
}

#[derive(Serialize)]
struct LoadTestResult<'a> {
    id: &'a str,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<&'a str>,
    #[serde(rename = "ResponsesData")]
    responses_data: &'a [ResponseRecord],
}

struct ControlBinding {
    run_id: String,
    topic: String,
    handler: Arc<dyn ControlHandler>,
}

struct ActiveRun;

impl ActiveRun {
    fn enter() -> Self {
        ACTIVE_LOADTESTS.inc();
        ActiveRun
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        ACTIVE_LOADTESTS.dec();
    }
}

/// Executes load-test runs against the shared transport and control bus.
#[derive(Clone)]
pub struct LoadTestRunner {
    transport: Arc<dyn Transport>,
    bus: ControlBus,
    timer: RequestTimer,
    topics: TopicScheme,
}

impl LoadTestRunner {
    pub fn new(
        transport: Arc<dyn Transport>,
        bus: ControlBus,
        timer: RequestTimer,
        topics: TopicScheme,
    ) -> Self {
        Self {
            transport,
            bus,
            timer,
            topics,
        }
    }

    /// Drive one run to completion.
    pub async fn run(&self, run: LoadTestRun) -> RunOutcome {
        let halt = Arc::new(HaltFlag::default());

        let binding = match run.uuid.as_deref() {
            Some(uuid) => match self.bind_control(uuid, &halt).await {
                Some(binding) => Some(binding),
                None => return RunOutcome::Abandoned,
            },
            None => None,
        };

        let _active = ActiveRun::enter();
        info!(
            run_id = %run.id,
            uuid = ?run.uuid,
            requests = run.requests.len(),
            iterate_until_ts = ?run.iterate_until_ts,
            "Load test started"
        );

        let mut summary = RunSummary::new();
        let results_topic = self.topics.loadtest_results(&run.id);

        'passes: loop {
            for request in &run.requests {
                if halt.is_halted() {
                    break 'passes;
                }
                let record = self.timer.execute(request).await;
                summary.record(&record);
                let envelope = LoadTestResult {
                    id: &run.id,
                    agent_id: self.topics.agent_id(),
                    uuid: run.uuid.as_deref(),
                    responses_data: slice::from_ref(&record),
                };
                publish_json(self.transport.as_ref(), &results_topic, &envelope).await;
            }
            summary.finish_iteration();

            // An empty batch would otherwise spin until the bound passes.
            if run.requests.is_empty()
                || halt.is_halted()
                || !should_repeat(run.iterate_until_ts, now_epoch_secs())
            {
                break;
            }
            debug!(run_id = %run.id, "Starting next pass");
        }

        if let Some(binding) = binding {
            self.release_control(binding).await;
        }

        let halted = halt.is_halted();
        let report = summary.report(
            &run.id,
            self.topics.agent_id(),
            run.uuid.as_deref(),
            halted,
        );
        info!(
            run_id = %run.id,
            halted,
            iterations = report.iterations,
            partial_pass = report.partial_pass,
            requests = report.requests,
            errors = report.errors,
            "Load test finished"
        );
        if let Some(latency) = &report.latency {
            info!(run_id = %run.id, "Load test latency: {}", latency.format());
        }
        publish_json(
            self.transport.as_ref(),
            &self.topics.loadtest_summary(&run.id),
            &report,
        )
        .await;
        RunOutcome::Finished(report)
    }

    async fn bind_control(&self, uuid: &str, halt: &Arc<HaltFlag>) -> Option<ControlBinding> {
        let topic = self.topics.loadtest_control(uuid);
        if let Err(e) = self.transport.subscribe(&topic).await {
            warn!(uuid = %uuid, topic = %topic, error = %e, "Control subscribe failed; abandoning run");
            return None;
        }
        let handler: Arc<dyn ControlHandler> = halt.clone();
        self.bus.register(uuid, handler.clone());
        Some(ControlBinding {
            run_id: uuid.to_string(),
            topic,
            handler,
        })
    }

    async fn release_control(&self, binding: ControlBinding) {
        if let Err(e) = self.transport.unsubscribe(&binding.topic).await {
            warn!(topic = %binding.topic, error = %e, "Control unsubscribe failed");
        }
        self.bus.unregister(&binding.run_id, &binding.handler);
    }
}
