//! The agent session task.
//!
//! Owns the connection to the agent: connect, register, heartbeat at the
//! agent-chosen interval, execute piggybacked commands, forward idle
//! notifications from the sampling loop, and reconnect with exponential
//! backoff (60 s ceiling) whenever anything breaks. After a reconnect
//! the session always re-registers before sending anything else.
//!
//! The task sees monitor state only through [`StateCell`] snapshots and
//! channels; it never holds the monitor object.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use snooze_core::InstanceState;
use snooze_protocol::{HeartbeatRequest, IdleNotification, MonitorCommand, StateChangeReport};
use snooze_rpc::AgentClient;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::monitor::Handlers;
use crate::state::StateCell;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Messages from the sampling loop to the session.
pub(crate) enum SessionEvent {
    IdleNotify(IdleNotification),
    StateChange(StateChangeReport),
}

pub(crate) struct SessionDeps {
    pub config: MonitorConfig,
    pub state: Arc<StateCell>,
    pub handlers: Arc<Handlers>,
    pub events: mpsc::Receiver<SessionEvent>,
    pub refresh_tx: mpsc::Sender<()>,
    pub cancel: CancellationToken,
}

pub(crate) async fn run_session(mut deps: SessionDeps) {
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        if deps.cancel.is_cancelled() {
            break;
        }

        let client = match AgentClient::connect(&deps.config.agent_endpoint).await {
            Ok(client) => client,
            Err(e) => {
                deps.handlers.fire_error(&MonitorError::Session(e));
                if wait_backoff(&deps.cancel, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        // Registration always precedes any other message on a connection.
        let heartbeat_interval = match client.register_instance(&deps.config.registration()).await {
            Ok(response) if response.success => {
                info!(agent = %response.agent_id, "registered with agent");
                response.heartbeat_interval
            }
            Ok(response) => {
                let reason = response.error.unwrap_or_else(|| "unspecified".to_string());
                deps.handlers
                    .fire_error(&MonitorError::RegistrationRejected(reason));
                if wait_backoff(&deps.cancel, &mut backoff).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                deps.handlers.fire_error(&MonitorError::Session(e));
                if wait_backoff(&deps.cancel, &mut backoff).await {
                    break;
                }
                continue;
            }
        };

        backoff = INITIAL_BACKOFF;
        deps.state.set_connected(true);

        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = deps.cancel.cancelled() => {
                    let _ = client
                        .unregister_instance(&deps.config.instance.instance_id)
                        .await;
                    deps.state.set_connected(false);
                    break 'reconnect;
                }

                _ = ticker.tick() => {
                    let snapshot = deps.state.snapshot();
                    let request = HeartbeatRequest {
                        instance_id: deps.config.instance.instance_id.clone(),
                        timestamp: Utc::now(),
                        state: if snapshot.is_idle {
                            InstanceState::Idle
                        } else {
                            InstanceState::Running
                        },
                        resource_usage: snapshot.current_usage,
                    };

                    match client.send_heartbeat(&request).await {
                        Ok(response) => {
                            for command in response.commands {
                                match command {
                                    MonitorCommand::Ping => debug!("agent ping"),
                                    MonitorCommand::Refresh => {
                                        debug!("agent requested refresh");
                                        let _ = deps.refresh_tx.try_send(());
                                    }
                                    MonitorCommand::Stop => {
                                        info!("agent requested session stop");
                                        let _ = client
                                            .unregister_instance(&deps.config.instance.instance_id)
                                            .await;
                                        deps.state.set_connected(false);
                                        break 'reconnect;
                                    }
                                    MonitorCommand::Unknown(raw) => {
                                        deps.handlers
                                            .fire_error(&MonitorError::UnknownCommand(raw));
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            deps.handlers.fire_error(&MonitorError::Session(e));
                            break;
                        }
                    }
                }

                event = deps.events.recv() => {
                    match event {
                        Some(SessionEvent::IdleNotify(notification)) => {
                            match client.send_idle_notification(&notification).await {
                                Ok(response) => {
                                    debug!(action = ?response.action, reason = ?response.reason, "idle verdict");
                                    deps.state.set_last_verdict(response.action);
                                }
                                Err(e) => {
                                    deps.handlers.fire_error(&MonitorError::Session(e));
                                    break;
                                }
                            }
                        }
                        Some(SessionEvent::StateChange(report)) => {
                            if let Err(e) = client.report_state_change(&report).await {
                                deps.handlers.fire_error(&MonitorError::Session(e));
                                break;
                            }
                        }
                        None => {
                            // Sampler gone; nothing left to forward.
                            debug!("sampler channel closed");
                        }
                    }
                }
            }
        }

        deps.state.set_connected(false);
        warn!("agent session lost, reconnecting");
        if wait_backoff(&deps.cancel, &mut backoff).await {
            break;
        }
    }

    deps.state.set_connected(false);
    debug!("session task finished");
}

/// Sleep for the current backoff (doubling it for next time, capped at
/// the ceiling). Returns true when cancelled.
async fn wait_backoff(cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    let delay = *backoff;
    *backoff = (*backoff * 2).min(BACKOFF_CEILING);
    debug!(?delay, "waiting before reconnect");

    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
