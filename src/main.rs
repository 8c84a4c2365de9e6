use std::sync::Arc;

use fleet_agent::agent::{shutdown_signal, Agent, ShutdownReason};
use fleet_agent::auth::SignatureVerifier;
use fleet_agent::config::AgentConfig;
use fleet_agent::control::ControlBus;
use fleet_agent::dispatcher::Dispatcher;
use fleet_agent::instance_lock::InstanceLock;
use fleet_agent::logging;
use fleet_agent::metrics::{register_metrics, start_metrics_server};
use fleet_agent::request_timer::RequestTimer;
use fleet_agent::tasks::TaskRegistry;
use fleet_agent::topics::TopicScheme;
use fleet_agent::transport::{Transport, WebSocketTransport};
use tracing::info;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Required environment variables:");
    eprintln!("  AGENT_PUBLIC_KEY        - Hex-encoded Ed25519 key that signs commands");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  AGENT_ID                - Agent identity (default: $HOSTNAME, else unknown-agent)");
    eprintln!("  AGENT_BROKER_URL        - Pub/sub relay URL (default: ws://127.0.0.1:8080/pubsub)");
    eprintln!("  AGENT_TOPIC_PREFIX      - Topic prefix (default: fleet)");
    eprintln!("  AGENT_LOCK_DIR          - Directory for the instance lock (default: system temp dir)");
    eprintln!("  AGENT_SHUTDOWN_GRACE    - Time to let handlers finish on shutdown: 5s, 1m (default: 5s)");
    eprintln!("  AGENT_CONFIG_FILE       - YAML file with base values; environment wins");
    eprintln!("  METRICS_PORT            - Prometheus port, 0 disables (default: 9090)");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric namespace (default: fleet_agent)");
    eprintln!("  LOG_FORMAT              - json or pretty (default: pretty)");
    eprintln!("  LOG_LEVEL               - Level filter when RUST_LOG is unset (default: info)");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match AgentConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };

    logging::init(config.log_format, &config.log_level);
    config.print_summary();

    let lock = InstanceLock::acquire(&config.lock_dir, &config.agent_id)?;

    if config.metrics_port != 0 {
        let registry = prometheus::default_registry().clone();
        register_metrics(&registry)?;
        tokio::spawn(start_metrics_server(config.metrics_port, registry));
    }

    let verifier = Arc::new(SignatureVerifier::new(config.verifying_key()?, 0));
    let topics = TopicScheme::new(&config.topic_prefix, &config.agent_id);

    let (transport, events) = WebSocketTransport::connect(&config.broker_url, &config.agent_id).await?;
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let tasks = TaskRegistry::with_builtin_modules();
    info!(modules = ?tasks.names(), "Task modules registered");

    let dispatcher = Dispatcher::new(
        Arc::clone(&transport),
        verifier,
        ControlBus::new(),
        RequestTimer::new(),
        tasks,
        topics.clone(),
        config.node_options(),
    );

    let agent = Agent::new(transport, events, dispatcher, topics, config.shutdown_grace)
        .with_lock(lock);
    match agent.run(shutdown_signal()).await? {
        ShutdownReason::DuplicateSession => {
            Err("another session took over this agent id".into())
        }
        ShutdownReason::Requested | ShutdownReason::TransportClosed => Ok(()),
    }
}
