//! End-to-end idle flow: monitor → agent → plugin runtime → mock plugin.
//!
//! The monitor runs with deterministic probes so the tests control
//! exactly what the host "does"; the agent and plugin are the real
//! thing. Tests needing the mock plugin binary skip (with a note) when
//! it has not been built yet.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use snooze_agent::{Agent, AgentConfig, Server};
use snooze_core::{InstanceState, Notification, NotificationSink, ResourceType};
use snooze_monitor::{FnProbe, InstanceIdentity, Monitor, MonitorConfig};
use snooze_plugins::{PluginRuntime, RuntimeConfig};
use snooze_protocol::{IdleAction, MonitorCommand};
use tokio_util::sync::CancellationToken;

fn mock_plugin_path() -> Option<PathBuf> {
    let target = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../target");
    ["debug", "release"]
        .iter()
        .map(|profile| target.join(profile).join("mock-plugin"))
        .find(|p| p.exists())
}

/// Helper macro to skip plugin-backed tests when the binary is absent.
macro_rules! skip_without_mock_plugin {
    () => {
        if mock_plugin_path().is_none() {
            eprintln!(
                "Skipping test: mock-plugin not built (run 'cargo build -p snooze-plugins' first)"
            );
            return;
        }
    };
}

/// Notification sink that records everything it sees.
#[derive(Default)]
struct RecordingSink {
    notifications: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

impl RecordingSink {
    fn count(&self, kind: &str) -> usize {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    agent: Arc<Agent>,
    sink: Arc<RecordingSink>,
    addr: std::net::SocketAddr,
    shutdown: tokio::sync::broadcast::Sender<()>,
}

/// Real agent + plugin runtime; the mock plugin (if built) is installed
/// as provider `mock`.
async fn start_harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime_config = RuntimeConfig::insecure(dir.path());
    std::fs::create_dir_all(&runtime_config.plugins_dir).unwrap();
    std::fs::create_dir_all(&runtime_config.config_dir).unwrap();
    if let Some(mock) = mock_plugin_path() {
        std::fs::copy(mock, runtime_config.plugins_dir.join("mock")).unwrap();
    }

    let runtime = Arc::new(PluginRuntime::new(runtime_config));

    let config = AgentConfig {
        heartbeat_interval: Duration::from_millis(200),
        stop_retry_base_delay: Duration::from_millis(50),
        ..AgentConfig::default()
    };

    let sink = Arc::new(RecordingSink::default());
    let agent = Arc::new(Agent::with_parts(
        config,
        runtime,
        Arc::new(snooze_agent::DefaultIdlePolicy),
        sink.clone(),
    ));

    let server = Server::bind("127.0.0.1:0", agent.clone()).await.expect("bind");
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    Harness {
        _dir: dir,
        agent,
        sink,
        addr,
        shutdown,
    }
}

/// Monitor with deterministic probes: cpu/memory driven by shared cells,
/// user_input pinned to zero. Thresholds `{cpu:10, memory:20,
/// user_input:0}`, per the canonical idle-stop scenario.
fn build_monitor(harness: &Harness, instance_id: &str, nap: Duration) -> (Monitor, Arc<AtomicU64>) {
    let identity = InstanceIdentity {
        instance_id: instance_id.to_string(),
        instance_type: "t3.large".to_string(),
        region: "us-west-2".to_string(),
        zone: "us-west-2a".to_string(),
        provider: "mock".to_string(),
    };

    let config = MonitorConfig::new(identity)
        .with_threshold(ResourceType::Cpu, 10.0)
        .with_threshold(ResourceType::Memory, 20.0)
        .with_threshold(ResourceType::UserInput, 0.0)
        .without_threshold(&ResourceType::Network)
        .without_threshold(&ResourceType::Disk)
        .without_threshold(&ResourceType::Gpu)
        .with_nap_time(nap)
        .with_check_interval(Duration::from_millis(500))
        .with_agent_endpoint(harness.addr.to_string());

    let monitor = Monitor::new(config);

    // cpu value in hundredths of a percent so tests can move it.
    let cpu = Arc::new(AtomicU64::new(100));
    let cpu_cell = cpu.clone();
    monitor.set_probe(Arc::new(FnProbe::new(ResourceType::Cpu, move || {
        Ok(cpu_cell.load(Ordering::SeqCst) as f64 / 100.0)
    })));
    monitor.set_probe(Arc::new(FnProbe::new(ResourceType::Memory, || Ok(5.0))));
    monitor.set_probe(Arc::new(FnProbe::new(ResourceType::UserInput, || Ok(0.0))));

    (monitor, cpu)
}

async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_idle_stop_path() {
    skip_without_mock_plugin!();
    let harness = start_harness().await;
    let (monitor, _cpu) = build_monitor(&harness, "i-s1", Duration::from_secs(2));

    let transitions: Arc<Mutex<Vec<bool>>> = Arc::default();
    let seen = transitions.clone();
    monitor.on_idle_state_change(move |is_idle, _| seen.lock().push(is_idle));

    monitor.start(CancellationToken::new()).expect("start");

    // Registration happens before any heartbeat.
    assert!(
        wait_for(Duration::from_secs(5), || harness
            .agent
            .registry
            .contains("i-s1"))
        .await,
        "monitor must register"
    );

    // Idle from the first tick; past nap time the agent schedules a stop
    // and the plugin brings the record to stopped.
    assert!(
        wait_for(Duration::from_secs(15), || {
            harness
                .agent
                .registry
                .get("i-s1")
                .map(|r| r.state == InstanceState::Stopped)
                .unwrap_or(false)
        })
        .await,
        "instance must reach stopped, registry: {:?}",
        harness.agent.registry.get("i-s1").map(|r| r.state)
    );

    // StopInstance concluded exactly once.
    assert_eq!(harness.sink.count("instance_stopped"), 1);
    assert_eq!(harness.sink.count("instance_stop_failed"), 0);

    // The monitor recorded the agent's stop verdict, and its own idle
    // duration had crossed nap time when it notified.
    let state = monitor.current_state();
    assert_eq!(state.last_verdict, Some(IdleAction::Stop));
    assert!(state.is_idle);
    assert!(state.idle_duration >= Duration::from_secs(2));

    // Exactly one active→idle transition, no spurious firings.
    assert_eq!(transitions.lock().as_slice(), &[true]);

    monitor.stop().await.expect("stop monitor");
    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn test_transient_activity_breaks_idle_epoch() {
    let harness = start_harness().await;
    // Nap time far away: this test is about the epoch, not the stop.
    let (monitor, cpu) = build_monitor(&harness, "i-s2", Duration::from_secs(600));

    let transitions: Arc<Mutex<Vec<bool>>> = Arc::default();
    let seen = transitions.clone();
    monitor.on_idle_state_change(move |is_idle, _| seen.lock().push(is_idle));

    monitor.start(CancellationToken::new()).expect("start");

    assert!(
        wait_for(Duration::from_secs(5), || monitor.is_idle()).await,
        "low usage must enter idle"
    );
    assert!(monitor.current_state().idle_since.is_some());

    // One probe spikes; the next evaluation must leave the idle epoch.
    cpu.store(5000, Ordering::SeqCst); // 50%
    assert!(
        wait_for(Duration::from_secs(5), || !monitor.is_idle()).await,
        "activity must break idle"
    );

    let state = monitor.current_state();
    assert!(state.idle_since.is_none(), "idle_since cleared");
    assert_eq!(state.idle_duration, Duration::ZERO);
    assert_eq!(
        state.last_verdict, None,
        "no idle notification for an epoch that never reached nap time"
    );
    assert_eq!(transitions.lock().as_slice(), &[true, false]);

    // Calm again: a fresh epoch begins with a fresh transition.
    cpu.store(100, Ordering::SeqCst);
    assert!(wait_for(Duration::from_secs(5), || monitor.is_idle()).await);
    assert_eq!(transitions.lock().as_slice(), &[true, false, true]);

    monitor.stop().await.expect("stop monitor");
    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn test_stop_command_ends_session() {
    let harness = start_harness().await;
    let (monitor, _cpu) = build_monitor(&harness, "i-cmd", Duration::from_secs(600));

    monitor.start(CancellationToken::new()).expect("start");
    assert!(
        wait_for(Duration::from_secs(5), || monitor
            .current_state()
            .connected_to_agent)
        .await
    );

    harness
        .agent
        .registry
        .queue_command("i-cmd", MonitorCommand::Stop)
        .unwrap();

    // The session executes the stop: unregisters and disconnects.
    assert!(
        wait_for(Duration::from_secs(5), || !monitor
            .current_state()
            .connected_to_agent)
        .await,
        "stop command must end the session"
    );
    assert!(!harness.agent.registry.contains("i-cmd"));

    monitor.stop().await.expect("stop monitor");
    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn test_unknown_command_reported_not_fatal() {
    let harness = start_harness().await;
    let (monitor, _cpu) = build_monitor(&harness, "i-unk", Duration::from_secs(600));

    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = errors.clone();
    monitor.on_error(move |e| seen.lock().push(e.to_string()));

    monitor.start(CancellationToken::new()).expect("start");
    assert!(
        wait_for(Duration::from_secs(5), || monitor
            .current_state()
            .connected_to_agent)
        .await
    );

    harness
        .agent
        .registry
        .queue_command("i-unk", MonitorCommand::Unknown("self_destruct".to_string()))
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || errors
            .lock()
            .iter()
            .any(|e| e.contains("self_destruct")))
        .await,
        "unknown command must reach the error handlers"
    );
    // The session survives it.
    assert!(monitor.current_state().connected_to_agent);

    monitor.stop().await.expect("stop monitor");
    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn test_start_twice_fails() {
    let harness = start_harness().await;
    let (monitor, _cpu) = build_monitor(&harness, "i-dup", Duration::from_secs(600));

    monitor.start(CancellationToken::new()).expect("first start");
    assert!(matches!(
        monitor.start(CancellationToken::new()),
        Err(snooze_monitor::MonitorError::AlreadyRunning)
    ));

    monitor.stop().await.expect("stop");
    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn test_monitor_reconnects_with_backoff() {
    // Reserve a port, then start the monitor before anything listens.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let identity = InstanceIdentity {
        instance_id: "i-late".to_string(),
        instance_type: "t3.large".to_string(),
        region: "us-west-2".to_string(),
        zone: "us-west-2a".to_string(),
        provider: "mock".to_string(),
    };
    let config = MonitorConfig::new(identity)
        .with_check_interval(Duration::from_millis(200))
        .with_agent_endpoint(addr.to_string());
    let monitor = Monitor::new(config);
    monitor.start(CancellationToken::new()).expect("start");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!monitor.current_state().connected_to_agent);

    // The agent shows up late on the same port; the monitor's backoff
    // loop must find it and register.
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(PluginRuntime::new(RuntimeConfig::insecure(dir.path())));
    let agent = Arc::new(Agent::new(AgentConfig::default(), runtime));
    let server = Server::bind(&addr.to_string(), agent.clone())
        .await
        .expect("bind reserved port");
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(
        wait_for(Duration::from_secs(10), || agent.registry.contains("i-late")).await,
        "monitor must re-register after reconnect"
    );
    assert!(monitor.current_state().connected_to_agent);

    monitor.stop().await.expect("stop");
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_scheduled_start_brings_instance_back() {
    skip_without_mock_plugin!();
    let harness = start_harness().await;

    // A stopped instance with a due start on its schedule; no monitor
    // involved, this is the agent's action scheduler at work.
    harness
        .agent
        .registry
        .register(snooze_protocol::InstanceRegistration {
            instance_id: "i-wake".to_string(),
            instance_type: "t3.large".to_string(),
            region: "us-west-2".to_string(),
            zone: "us-west-2a".to_string(),
            provider: "mock".to_string(),
            thresholds: HashMap::new(),
            nap_time: Duration::from_secs(60),
            metadata: HashMap::new(),
        });
    let registry = &harness.agent.registry;
    registry.update_state("i-wake", InstanceState::Idle).unwrap();
    registry.update_state("i-wake", InstanceState::Stopping).unwrap();
    registry.update_state("i-wake", InstanceState::Stopped).unwrap();
    registry
        .add_scheduled_action(
            "i-wake",
            snooze_core::ScheduledAction::start_at(chrono::Utc::now(), "business hours"),
        )
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            registry
                .get("i-wake")
                .map(|r| r.state == InstanceState::Running)
                .unwrap_or(false)
        })
        .await,
        "scheduled start must bring the instance back to running"
    );
    assert_eq!(harness.sink.count("instance_started"), 1);
    assert!(registry.get("i-wake").unwrap().scheduled_actions.is_empty());

    let _ = harness.shutdown.send(());
}

#[tokio::test]
async fn test_registration_carries_thresholds() {
    let harness = start_harness().await;
    let (monitor, _cpu) = build_monitor(&harness, "i-reg", Duration::from_secs(600));

    monitor.start(CancellationToken::new()).expect("start");
    assert!(
        wait_for(Duration::from_secs(5), || harness
            .agent
            .registry
            .contains("i-reg"))
        .await
    );

    let record = harness.agent.registry.get("i-reg").unwrap();
    let expected: HashMap<ResourceType, f64> = HashMap::from([
        (ResourceType::Cpu, 10.0),
        (ResourceType::Memory, 20.0),
        (ResourceType::UserInput, 0.0),
    ]);
    assert_eq!(record.registration.thresholds, expected);
    assert_eq!(record.registration.nap_time, Duration::from_secs(600));

    monitor.stop().await.expect("stop");
    let _ = harness.shutdown.send(());
}
