//! Agent RPC server: newline-delimited JSON-RPC 2.0 over TCP.
//!
//! [`Agent`] holds the behavior (registry, policy, dispatcher) and is
//! fully testable without sockets; [`Server`] owns the listener, one task
//! per connection, the stale-heartbeat sweeper and the shutdown
//! broadcast.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use snooze_core::{Notification, NotificationSeverity, NotificationSink, TracingSink};
use snooze_plugins::PluginRuntime;
use snooze_protocol::envelope::{codes, RpcRequest, RpcResponse};
use snooze_protocol::methods;
use snooze_protocol::{
    HeartbeatRequest, HeartbeatResponse, IdleAction, IdleNotification, IdleResponse,
    InstanceRegistration, RegistrationResponse, SimpleAck, StateChangeReport, UnregisterRequest,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::dispatch::ActionDispatcher;
use crate::error::{AgentError, Result};
use crate::policy::{DefaultIdlePolicy, IdlePolicy};
use crate::registry::InstanceRegistry;

/// The agent's behavior, independent of any transport.
pub struct Agent {
    pub agent_id: String,
    pub config: AgentConfig,
    pub registry: Arc<InstanceRegistry>,
    pub runtime: Arc<PluginRuntime>,
    policy: Arc<dyn IdlePolicy>,
    dispatcher: ActionDispatcher,
    sink: Arc<dyn NotificationSink>,
}

impl Agent {
    pub fn new(config: AgentConfig, runtime: Arc<PluginRuntime>) -> Self {
        Self::with_parts(
            config,
            runtime,
            Arc::new(DefaultIdlePolicy),
            Arc::new(TracingSink),
        )
    }

    pub fn with_parts(
        config: AgentConfig,
        runtime: Arc<PluginRuntime>,
        policy: Arc<dyn IdlePolicy>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new());
        let dispatcher = ActionDispatcher::new(registry.clone(), runtime.clone(), sink.clone(), &config);
        Self {
            agent_id: format!("agent-{}", Uuid::new_v4()),
            config,
            registry,
            runtime,
            policy,
            dispatcher,
            sink,
        }
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    fn handle_register(&self, registration: InstanceRegistration) -> RegistrationResponse {
        self.registry.register(registration);
        RegistrationResponse {
            success: true,
            error: None,
            agent_id: self.agent_id.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
        }
    }

    fn handle_unregister(&self, request: UnregisterRequest) -> Result<SimpleAck> {
        self.registry.unregister(&request.instance_id)?;
        Ok(SimpleAck::ok())
    }

    fn handle_heartbeat(&self, heartbeat: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let commands = self.registry.touch_heartbeat(
            &heartbeat.instance_id,
            heartbeat.state,
            heartbeat.resource_usage,
        )?;
        Ok(HeartbeatResponse {
            acknowledged: true,
            commands,
        })
    }

    fn handle_idle(&self, notification: IdleNotification) -> Result<IdleResponse> {
        let instance_id = notification.instance_id.clone();

        self.registry.update_idle(
            &instance_id,
            notification.idle_since,
            notification.idle_duration,
            notification.resource_usage.clone(),
        )?;

        let record = self.registry.get(&instance_id)?;
        let response = self.policy.arbitrate(&record, &notification);

        if response.action == IdleAction::Stop {
            // Win the in-flight flag before touching the schedule so a
            // concurrent re-notification cannot double-dispatch.
            if self.registry.set_stop_in_flight(&instance_id, true)? {
                return Ok(IdleResponse {
                    action: IdleAction::None,
                    reason: Some("already scheduled".to_string()),
                    scheduled_action: None,
                });
            }

            if let Some(action) = &response.scheduled_action {
                self.registry
                    .add_scheduled_action(&instance_id, action.clone())?;
            }
            info!(instance = %instance_id, "idle past nap time, scheduling stop");
            self.dispatcher.spawn_stop(instance_id);
        }

        Ok(response)
    }

    async fn handle_state_change(&self, report: StateChangeReport) -> Result<SimpleAck> {
        let ack = match self
            .registry
            .update_state(&report.instance_id, report.current_state)
        {
            Ok(_) => SimpleAck::ok(),
            Err(AgentError::InvalidTransition { from, to, .. }) => SimpleAck {
                acknowledged: false,
                error: Some(format!("illegal transition {} -> {}", from, to)),
            },
            Err(e) => return Err(e),
        };

        self.sink
            .notify(
                Notification::new(
                    "instance_state_changed",
                    NotificationSeverity::Info,
                    &report.instance_id,
                )
                .with_data("previous", report.previous_state.to_string())
                .with_data("current", report.current_state.to_string())
                .with_data("reason", report.reason.clone()),
            )
            .await;

        Ok(ack)
    }

    /// Execute scheduled actions whose time has arrived. Runs on the
    /// server's periodic tick; also callable directly for tests.
    pub async fn run_due_actions(&self) {
        let now = chrono::Utc::now();
        for record in self.registry.get_all() {
            let instance_id = record.instance_id().to_string();
            let Some((index, action)) = record
                .scheduled_actions
                .iter()
                .enumerate()
                .find(|(_, a)| a.is_due(now))
                .map(|(i, a)| (i, a.clone()))
            else {
                continue;
            };

            match action.action {
                snooze_core::ActionKind::Stop => {
                    // Lost race means a dispatch is already running.
                    if let Ok(false) = self.registry.set_stop_in_flight(&instance_id, true) {
                        info!(instance = %instance_id, reason = %action.reason, "executing scheduled stop");
                        self.dispatcher.spawn_stop(instance_id);
                    }
                }
                snooze_core::ActionKind::Start => {
                    if self.registry.remove_scheduled_action(&instance_id, index).is_ok() {
                        info!(instance = %instance_id, reason = %action.reason, "executing scheduled start");
                        let dispatcher = self.dispatcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dispatcher.execute_start(&instance_id).await {
                                warn!(instance = %instance_id, error = %e, "scheduled start failed");
                            }
                        });
                    }
                }
            }
        }
    }

    /// Dispatch one request. The boolean asks the server to shut down.
    pub async fn dispatch(&self, request: RpcRequest) -> (RpcResponse, bool) {
        let id = request.id;
        let method = request.method.as_str();

        let result: Result<Value> = match method {
            methods::INSTANCE_REGISTER => parse(request.params)
                .map(|registration| to_value(self.handle_register(registration))),
            methods::INSTANCE_UNREGISTER => {
                parse(request.params).and_then(|r| self.handle_unregister(r).map(to_value))
            }
            methods::INSTANCE_HEARTBEAT => {
                parse(request.params).and_then(|h| self.handle_heartbeat(h).map(to_value))
            }
            methods::INSTANCE_IDLE => {
                parse(request.params).and_then(|n| self.handle_idle(n).map(to_value))
            }
            methods::INSTANCE_STATE_CHANGE => match parse(request.params) {
                Ok(report) => self.handle_state_change(report).await.map(to_value),
                Err(e) => Err(e),
            },
            methods::AGENT_PING => Ok(Value::String("pong".to_string())),
            methods::AGENT_SHUTDOWN => {
                return (
                    RpcResponse::success(id, serde_json::json!({"acknowledged": true})),
                    true,
                )
            }
            other => {
                return (
                    RpcResponse::failure(
                        id,
                        codes::METHOD_NOT_FOUND,
                        format!("unknown method '{}'", other),
                    ),
                    false,
                )
            }
        };

        let response = match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(e) => RpcResponse::failure(id, error_code(&e), e.to_string()),
        };
        (response, false)
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(AgentError::Serialization)
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn error_code(error: &AgentError) -> i64 {
    match error {
        AgentError::UnknownInstance(_) => codes::UNKNOWN_INSTANCE,
        AgentError::Serialization(_) => codes::INVALID_PARAMS,
        AgentError::InvalidTransition { .. } | AgentError::NoSuchAction { .. } => codes::REFUSED,
        AgentError::Plugin(_) | AgentError::Io(_) => codes::INTERNAL_ERROR,
    }
}

/// TCP front end for an [`Agent`].
pub struct Server {
    listener: TcpListener,
    agent: Arc<Agent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub async fn bind(addr: &str, agent: Arc<Agent>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(4);
        info!(addr = %listener.local_addr()?, agent_id = %agent.agent_id, "agent listening");
        Ok(Self {
            listener,
            agent,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener")
    }

    /// Clone of the shutdown trigger; send to stop [`Server::run`].
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until shut down. Also runs the stale-heartbeat sweeper.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let sweeper = {
            let agent = self.agent.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(agent.config.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for instance_id in agent.registry.mark_stale(agent.config.stale_after()) {
                                agent
                                    .sink
                                    .notify(Notification::new(
                                        "instance_disconnected",
                                        NotificationSeverity::Warning,
                                        instance_id,
                                    ))
                                    .await;
                            }
                            agent.run_due_actions().await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        };

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "monitor connected");
                            let agent = self.agent.clone();
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, agent, shutdown_tx).await {
                                    debug!(peer = %peer, error = %e, "connection closed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("agent shutting down");
                    break;
                }
            }
        }

        sweeper.abort();
        self.agent.runtime.shutdown_all().await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    agent: Arc<Agent>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown_rx.recv() => break,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let (response, shutdown) = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => agent.dispatch(request).await,
            Err(e) => (
                RpcResponse::failure(0, codes::PARSE_ERROR, e.to_string()),
                false,
            ),
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
        write_half.flush().await?;

        if shutdown {
            let _ = shutdown_tx.send(());
            break;
        }
    }
    Ok(())
}
