use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Histogram, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::env;
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "fleet_agent".to_string());

    // === Command pipeline ===

    pub static ref COMMANDS_RECEIVED: IntCounterVec =
        IntCounterVec::new(
            Opts::new("commands_received_total", "Authorized commands dispatched, by command")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["command"]
        ).expect("valid metric definition");

    pub static ref COMMANDS_REJECTED: IntCounterVec =
        IntCounterVec::new(
            Opts::new("commands_rejected_total", "Inbound messages dropped before dispatch, by reason")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["reason"]  // malformed, unauthorized, bad_signature, unknown_command
        ).expect("valid metric definition");

    pub static ref TASK_FAILURES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("task_failures_total", "Task module invocations that failed, by command")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["command"]
        ).expect("valid metric definition");

    // === Probes ===

    pub static ref PROBES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("probes_total", "Probes executed, by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // ok or an error category label
        ).expect("valid metric definition");

    pub static ref PROBE_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "probe_duration_seconds",
                "Total probe duration in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).expect("valid metric definition");

    // === Load tests ===

    pub static ref ACTIVE_LOADTESTS: IntGauge =
        IntGauge::with_opts(
            Opts::new("active_loadtests", "Load-test runs currently executing")
                .namespace(METRIC_NAMESPACE.as_str())
        ).expect("valid metric definition");
}

/// Registers all metrics with the given registry.
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(COMMANDS_RECEIVED.clone()))?;
    registry.register(Box::new(COMMANDS_REJECTED.clone()))?;
    registry.register(Box::new(TASK_FAILURES.clone()))?;
    registry.register(Box::new(PROBES_TOTAL.clone()))?;
    registry.register(Box::new(PROBE_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(ACTIVE_LOADTESTS.clone()))?;
    Ok(())
}

/// Encodes every metric in the registry in the Prometheus text format.
pub fn gather_metrics_string(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# ERROR ENCODING METRICS");
    }
    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# ERROR ENCODING METRICS TO UTF-8"))
}

/// HTTP handler for the Prometheus metrics endpoint.
async fn metrics_handler(
    req: Request<Body>,
    registry: Registry,
) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/metrics" {
        let mut not_found = Response::new(Body::from("not found"));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        return Ok(not_found);
    }

    let mut response = Response::new(Body::from(gather_metrics_string(&registry)));
    if let Ok(content_type) = TextEncoder::new().format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

/// Starts the Prometheus metrics HTTP server. Runs until the process exits.
pub async fn start_metrics_server(port: u16, registry: Registry) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                metrics_handler(req, registry.clone())
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}
