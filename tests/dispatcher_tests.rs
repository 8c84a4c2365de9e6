//! End-to-end command handling through the dispatcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{envelope, signing_key, verifier, Op, RecordingTransport};
use fleet_agent::auth::seal;
use fleet_agent::control::ControlBus;
use fleet_agent::dispatcher::Dispatcher;
use fleet_agent::request_timer::RequestTimer;
use fleet_agent::tasks::{TaskError, TaskModule, TaskRegistry};
use fleet_agent::topics::TopicScheme;
use fleet_agent::utils::now_epoch_ms;

const DIRECT: &str = "fleet/agents/a1/commands";

struct Echo {
    arguments: Value,
}

#[async_trait]
impl TaskModule for Echo {
    fn set_arguments(&mut self, arguments: &Value) -> Result<(), TaskError> {
        self.arguments = arguments.clone();
        Ok(())
    }

    async fn run(&mut self) -> Result<Value, TaskError> {
        Ok(json!({"echo": self.arguments}))
    }
}

struct Broken;

#[async_trait]
impl TaskModule for Broken {
    async fn run(&mut self) -> Result<Value, TaskError> {
        Err(TaskError::Failed("disk on fire".to_string()))
    }
}

struct Panics;

#[async_trait]
impl TaskModule for Panics {
    async fn run(&mut self) -> Result<Value, TaskError> {
        panic!("module bug");
    }
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtin_modules();
    registry.register("echo", || Box::new(Echo { arguments: Value::Null }));
    registry.register("broken", || Box::new(Broken));
    registry.register("panics", || Box::new(Panics));
    registry
}

fn dispatcher(transport: &RecordingTransport) -> Dispatcher {
    Dispatcher::new(
        Arc::new(transport.clone()),
        verifier(),
        ControlBus::new(),
        RequestTimer::new(),
        registry(),
        TopicScheme::new("fleet", "a1"),
        json!({"agentId": "a1"}),
    )
}

async fn ok_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn loadtest_publishes_each_result_then_unsubscribes() {
    let server = ok_server().await;
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let payload = envelope(json!({
        "command": "loadtest",
        "uuid": "u1",
        "id": "r1",
        "requests": [
            {"id": 1, "url": format!("{}/a", server.uri())},
            {"id": 2, "url": format!("{}/b", server.uri())},
        ],
    }));
    dispatcher
        .on_message(DIRECT, &payload)
        .expect("accepted")
        .await
        .unwrap();

    let results = transport.published_to("fleet/loadtests/r1/results/a1");
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result["ResponsesData"].as_array().unwrap().len(), 1);
    }

    let ops = transport.ops();
    let unsubscribe = Op::Unsubscribe("fleet/loadtests/u1/manage".to_string());
    assert_eq!(transport.count(&unsubscribe), 1);
    let last_result = ops
        .iter()
        .rposition(|op| matches!(op, Op::Publish { topic, .. } if topic.ends_with("/results/a1")))
        .unwrap();
    assert!(transport.position(&unsubscribe).unwrap() > last_result);
}

#[tokio::test]
async fn manage_topic_halts_running_loadtest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let start = envelope(json!({
        "command": "loadtest",
        "uuid": "u1",
        "id": "r1",
        "requests": [
            {"id": 1, "url": format!("{}/slow", server.uri())},
            {"id": 2, "url": format!("{}/slow", server.uri())},
        ],
    }));
    let run = dispatcher.on_message(DIRECT, &start).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.bus().active_runs(), vec!["u1".to_string()]);

    let halt = envelope(json!({"command": "manageloadtest", "action": "halt"}));
    dispatcher
        .on_message("fleet/loadtests/u1/manage", &halt)
        .expect("accepted")
        .await
        .unwrap();
    run.await.unwrap();

    let results = transport.published_to("fleet/loadtests/r1/results/a1");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ResponsesData"][0]["id"], 1);
    assert!(dispatcher.bus().active_runs().is_empty());
}

#[tokio::test]
async fn manage_on_unrelated_topic_is_dropped() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);
    let halt = envelope(json!({"command": "manageloadtest", "action": "halt"}));
    assert!(dispatcher.on_message(DIRECT, &halt).is_none());
}

#[tokio::test]
async fn halt_for_unknown_run_is_harmless() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);
    let halt = envelope(json!({"command": "manageloadtest", "action": "halt"}));
    dispatcher
        .on_message("fleet/loadtests/nobody/manage", &halt)
        .expect("accepted")
        .await
        .unwrap();
    assert!(transport.ops().is_empty());
}

#[tokio::test]
async fn rejected_messages_are_silent() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let stale = seal(
        &signing_key(),
        &format!("controller|{}", now_epoch_ms() - 1_800_001 - 60_000),
    );
    let unsigned_cases = [
        b"not json".to_vec(),
        b"[1,2,3]".to_vec(),
        serde_json::to_vec(&json!({
            "command": "settime", "time": 0,
            "authtype": "all", "signature": stale,
        }))
        .unwrap(),
        serde_json::to_vec(&json!({
            "command": "settime", "time": 0, "authtype": "all",
        }))
        .unwrap(),
    ];
    for payload in unsigned_cases {
        assert!(dispatcher.on_message(DIRECT, &payload).is_none());
    }

    let mut unauthorized: Value =
        serde_json::from_slice(&envelope(json!({"command": "settime", "time": 0}))).unwrap();
    unauthorized["authtype"] = json!("randomselect");
    unauthorized["authdata"] = json!(0);
    assert!(dispatcher
        .on_message(DIRECT, &serde_json::to_vec(&unauthorized).unwrap())
        .is_none());

    unauthorized["authtype"] = json!("somebody");
    assert!(dispatcher
        .on_message(DIRECT, &serde_json::to_vec(&unauthorized).unwrap())
        .is_none());

    let unknown = envelope(json!({"command": "reboot"}));
    assert!(dispatcher.on_message(DIRECT, &unknown).is_none());

    let no_id = envelope(json!({"command": "loadtest", "requests": []}));
    assert!(dispatcher.on_message(DIRECT, &no_id).is_none());

    assert!(transport.ops().is_empty());
    assert_eq!(dispatcher.verifier().clock_offset(), 0);
}

#[tokio::test]
async fn ids_that_span_topic_levels_are_rejected() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    for (uuid, id) in [("a/b", "r1"), ("+", "r1"), ("#", "r1"), ("u1", "r/1"), ("u1", "r+")] {
        let payload = envelope(json!({
            "command": "loadtest",
            "uuid": uuid,
            "id": id,
            "iterateUntilTs": 9_999_999_999.0,
            "requests": [{"id": 1, "url": "http://127.0.0.1:1/"}],
        }));
        assert!(
            dispatcher.on_message(DIRECT, &payload).is_none(),
            "uuid={:?} id={:?}",
            uuid,
            id
        );
    }

    let health = envelope(json!({"command": "endpointhealth", "id": "h/1", "requests": []}));
    assert!(dispatcher.on_message(DIRECT, &health).is_none());
    let task = envelope(json!({"command": "execute", "module": "echo", "id": "#"}));
    assert!(dispatcher.on_message(DIRECT, &task).is_none());

    assert!(transport.ops().is_empty());
    assert!(dispatcher.bus().active_runs().is_empty());
}

#[tokio::test]
async fn settime_recalibrates_clock_offset() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let signer_time = now_epoch_ms() - 3_600_000;
    let payload = envelope(json!({"command": "settime", "time": signer_time}));
    dispatcher.on_message(DIRECT, &payload).unwrap().await.unwrap();

    let offset = dispatcher.verifier().clock_offset();
    assert!(
        (3_600_000..3_660_000).contains(&offset),
        "offset = {}",
        offset
    );
}

#[tokio::test]
async fn subscribetopic_manages_wildcards() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let subscribe = envelope(json!({"command": "subscribetopic", "topic": "metrics/cpu"}));
    dispatcher.on_message(DIRECT, &subscribe).unwrap().await.unwrap();
    let unsubscribe = envelope(json!({"command": "unsubscribetopic", "topic": "metrics/cpu"}));
    dispatcher.on_message(DIRECT, &unsubscribe).unwrap().await.unwrap();

    assert_eq!(
        transport.ops(),
        vec![
            Op::Subscribe("fleet/metrics/cpu/#".to_string()),
            Op::Unsubscribe("fleet/metrics/cpu/#".to_string()),
        ]
    );

    for bad in ["", "a/+", "#"] {
        let payload = envelope(json!({"command": "subscribetopic", "topic": bad}));
        assert!(dispatcher.on_message(DIRECT, &payload).is_none(), "{:?}", bad);
    }
}

#[tokio::test]
async fn endpointhealth_publishes_per_probe() {
    let server = ok_server().await;
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let payload = envelope(json!({
        "command": "endpointhealth",
        "id": "h1",
        "requests": [
            {"id": "a", "url": format!("{}/a", server.uri())},
            {"id": "b", "url": "http://127.0.0.1:1/"},
        ],
    }));
    dispatcher.on_message(DIRECT, &payload).unwrap().await.unwrap();

    let results = transport.published_to("fleet/endpointhealth/h1/results/a1");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["ResponsesData"][0]["statusCode"], 200);
    assert_eq!(results[1]["ResponsesData"][0]["errorCategory"], "connect_error");
    assert_eq!(results[1]["agentId"], "a1");
}

#[tokio::test]
async fn task_module_result_is_published() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let payload = envelope(json!({
        "command": "customcommand",
        "module": "echo",
        "arguments": {"n": 3},
    }));
    dispatcher.on_message(DIRECT, &payload).unwrap().await.unwrap();

    let results = transport.published_to("fleet/customcommand/default/results/a1");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ReturnValue"]["echo"]["n"], 3);
    assert_eq!(results[0]["command"], "customcommand");

    let payload = envelope(json!({"command": "execute", "module": "echo", "id": "job-9"}));
    dispatcher.on_message(DIRECT, &payload).unwrap().await.unwrap();
    assert_eq!(
        transport.published_to("fleet/execute/job-9/results/a1").len(),
        1
    );
}

#[tokio::test]
async fn hostmonitoring_uses_builtin_module() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    let payload = envelope(json!({"command": "hostmonitoring"}));
    dispatcher.on_message(DIRECT, &payload).unwrap().await.unwrap();

    let results = transport.published_to("fleet/hostmonitoring/default/results/a1");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ReturnValue"]["agentId"], "a1");
}

#[tokio::test]
async fn failing_modules_publish_nothing() {
    let transport = RecordingTransport::new();
    let dispatcher = dispatcher(&transport);

    for module in ["broken", "panics", "missing"] {
        let payload = envelope(json!({"command": "execute", "module": module}));
        dispatcher
            .on_message(DIRECT, &payload)
            .expect("accepted")
            .await
            .expect("failure contained");
    }
    assert!(transport.ops().is_empty());

    // The dispatcher keeps working afterwards.
    let payload = envelope(json!({"command": "execute", "module": "echo"}));
    dispatcher.on_message(DIRECT, &payload).unwrap().await.unwrap();
    assert_eq!(transport.ops().len(), 1);

    let no_module = envelope(json!({"command": "execute"}));
    assert!(dispatcher.on_message(DIRECT, &no_module).is_none());
}
