//! RPC contract tests for the agent server.
//!
//! These tests pin the request/response shapes on the wire: raw JSON
//! lines over TCP, no client library in between.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use snooze_agent::{Agent, AgentConfig, Server};
use snooze_plugins::{PluginRuntime, RuntimeConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct TestAgent {
    _dir: tempfile::TempDir,
    addr: std::net::SocketAddr,
    shutdown: tokio::sync::broadcast::Sender<()>,
    agent: Arc<Agent>,
}

async fn start_agent() -> TestAgent {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(PluginRuntime::new(RuntimeConfig::insecure(dir.path())));
    let agent = Arc::new(Agent::new(AgentConfig::default(), runtime));

    let server = Server::bind("127.0.0.1:0", agent.clone())
        .await
        .expect("bind");
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestAgent {
        _dir: dir,
        addr,
        shutdown,
        agent,
    }
}

async fn connect(agent: &TestAgent) -> TcpStream {
    TcpStream::connect(agent.addr).await.expect("connect")
}

async fn rpc_call(stream: &mut TcpStream, method: &str, params: Value, id: i64) -> Value {
    let request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });

    let line = format!("{}\n", serde_json::to_string(&request).unwrap());
    stream.write_all(line.as_bytes()).await.expect("write");

    let (read_half, _) = stream.split();
    let mut lines = BufReader::new(read_half).lines();
    let response = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("response in time")
        .expect("read")
        .expect("line");

    serde_json::from_str(&response).expect("parse response")
}

fn registration_params(id: &str) -> Value {
    json!({
        "instance_id": id,
        "instance_type": "t3.large",
        "region": "us-west-2",
        "zone": "us-west-2a",
        "provider": "mock",
        "thresholds": {"cpu": 10.0, "user_input": 0.0},
        "nap_time": "1h",
    })
}

#[tokio::test]
async fn test_register_contract() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    let response = rpc_call(&mut stream, "instance.register", registration_params("i-1"), 1).await;

    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["success"], true);
    assert_eq!(response["result"]["heartbeat_interval"], "30s");
    assert!(response["result"]["agent_id"]
        .as_str()
        .unwrap()
        .starts_with("agent-"));

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_ping_contract() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    let response = rpc_call(&mut stream, "agent.ping", Value::Null, 1).await;
    assert_eq!(response["result"], "pong");

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_heartbeat_drains_commands_in_order() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    rpc_call(&mut stream, "instance.register", registration_params("i-1"), 1).await;

    agent
        .agent
        .registry
        .queue_command("i-1", snooze_protocol::MonitorCommand::Refresh)
        .unwrap();
    agent
        .agent
        .registry
        .queue_command("i-1", snooze_protocol::MonitorCommand::Ping)
        .unwrap();

    let heartbeat = json!({
        "instance_id": "i-1",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "state": "running",
        "resource_usage": {},
    });

    let response = rpc_call(&mut stream, "instance.heartbeat", heartbeat.clone(), 2).await;
    assert_eq!(response["result"]["acknowledged"], true);
    assert_eq!(response["result"]["commands"], json!(["refresh", "ping"]));

    // Queue was drained atomically; the next heartbeat sees nothing.
    let response = rpc_call(&mut stream, "instance.heartbeat", heartbeat, 3).await;
    assert_eq!(response["result"]["commands"], json!([]));

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_heartbeat_without_commands_only_touches_freshness() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    rpc_call(&mut stream, "instance.register", registration_params("i-1"), 1).await;
    let before = agent.agent.registry.get("i-1").unwrap();

    let heartbeat = json!({
        "instance_id": "i-1",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "state": "running",
        "resource_usage": {
            "cpu": {"kind": "cpu", "value": 55.5, "taken_at": chrono::Utc::now().to_rfc3339()},
        },
    });
    let response = rpc_call(&mut stream, "instance.heartbeat", heartbeat, 2).await;
    assert_eq!(response["result"]["acknowledged"], true);

    let after = agent.agent.registry.get("i-1").unwrap();
    assert_eq!(after.state, before.state);
    assert!(after.last_heartbeat >= before.last_heartbeat);
    assert_eq!(
        after.latest_usage[&snooze_core::ResourceType::Cpu].value,
        55.5
    );
    assert_eq!(after.scheduled_actions.len(), 0);

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_idle_notification_wait_verdict() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    rpc_call(&mut stream, "instance.register", registration_params("i-1"), 1).await;

    let notification = json!({
        "instance_id": "i-1",
        "idle_since": chrono::Utc::now().to_rfc3339(),
        "idle_duration": "10s",
        "resource_usage": {},
    });
    let response = rpc_call(&mut stream, "instance.idle", notification, 2).await;

    assert_eq!(response["result"]["action"], "wait");
    assert!(response["result"]["reason"]
        .as_str()
        .unwrap()
        .contains("nap time"));

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_unknown_instance_is_error_object() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    let heartbeat = json!({
        "instance_id": "i-ghost",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "state": "running",
        "resource_usage": {},
    });
    let response = rpc_call(&mut stream, "instance.heartbeat", heartbeat, 1).await;

    assert!(response["error"].is_object(), "expected error object");
    assert_eq!(response["error"]["code"], -32000);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not found"));

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_state_change_contract() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    rpc_call(&mut stream, "instance.register", registration_params("i-1"), 1).await;

    let report = json!({
        "instance_id": "i-1",
        "previous_state": "running",
        "current_state": "idle",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "reason": "all thresholds below limits",
    });
    let response = rpc_call(&mut stream, "instance.state_change", report, 2).await;
    assert_eq!(response["result"]["acknowledged"], true);

    assert_eq!(
        agent.agent.registry.get("i-1").unwrap().state,
        snooze_core::InstanceState::Idle
    );

    let _ = agent.shutdown.send(());
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    let response = rpc_call(&mut stream, "agent.shutdown", Value::Null, 1).await;
    assert_eq!(response["result"]["acknowledged"], true);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        TcpStream::connect(agent.addr).await.is_err(),
        "listener must be gone after shutdown"
    );
}

#[tokio::test]
async fn test_unregister_then_register_is_fresh() {
    let agent = start_agent().await;
    let mut stream = connect(&agent).await;

    rpc_call(&mut stream, "instance.register", registration_params("i-1"), 1).await;
    rpc_call(
        &mut stream,
        "instance.state_change",
        json!({
            "instance_id": "i-1",
            "previous_state": "running",
            "current_state": "idle",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "reason": "idle",
        }),
        2,
    )
    .await;

    let response = rpc_call(
        &mut stream,
        "instance.unregister",
        json!({"instance_id": "i-1"}),
        3,
    )
    .await;
    assert_eq!(response["result"]["acknowledged"], true);

    rpc_call(&mut stream, "instance.register", registration_params("i-1"), 4).await;
    let record = agent.agent.registry.get("i-1").unwrap();
    assert_eq!(record.state, snooze_core::InstanceState::Running);
    assert!(record.idle_since.is_none());

    let _ = agent.shutdown.send(());
}
