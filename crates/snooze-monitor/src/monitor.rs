//! The monitor facade and its sampling loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use snooze_core::{InstanceState, ResourceSample, ResourceType};
use snooze_protocol::{IdleNotification, StateChangeReport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::evaluator;
use crate::probes::{FnProbe, Probe, ProbeSet};
use crate::session::{run_session, SessionDeps, SessionEvent};
use crate::state::{MonitorState, StateCell};

type IdleChangeHandler = Arc<dyn Fn(bool, Duration) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&MonitorError) + Send + Sync>;

/// Callback registries shared by both tasks.
#[derive(Default)]
pub(crate) struct Handlers {
    idle_change: RwLock<Vec<IdleChangeHandler>>,
    error: RwLock<Vec<ErrorHandler>>,
}

impl Handlers {
    pub(crate) fn fire_idle_change(&self, is_idle: bool, duration: Duration) {
        debug!(is_idle, ?duration, "idle state changed");
        for handler in self.idle_change.read().iter() {
            handler(is_idle, duration);
        }
    }

    pub(crate) fn fire_error(&self, error: &MonitorError) {
        debug!(error = %error, "monitor error");
        for handler in self.error.read().iter() {
            handler(error);
        }
    }
}

struct RunningTasks {
    cancel: CancellationToken,
    sampler: JoinHandle<()>,
    session: JoinHandle<()>,
}

/// The resource monitor: probes, idle state machine, agent session.
pub struct Monitor {
    config: MonitorConfig,
    probes: Arc<ProbeSet>,
    state: Arc<StateCell>,
    handlers: Arc<Handlers>,
    running: Mutex<Option<RunningTasks>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            probes: Arc::new(ProbeSet::with_builtins()),
            state: Arc::new(StateCell::new()),
            handlers: Arc::new(Handlers::default()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Register a custom probe under `custom:<name>`. The name becomes a
    /// first-class resource kind for thresholds and wire messages.
    pub fn add_probe(
        &self,
        name: &str,
        f: impl Fn() -> anyhow::Result<f64> + Send + Sync + 'static,
    ) {
        self.probes.insert(Arc::new(FnProbe::new(
            ResourceType::Custom(name.to_string()),
            f,
        )));
    }

    /// Replace the probe for a kind (including built-ins).
    pub fn set_probe(&self, probe: Arc<dyn Probe>) {
        self.probes.insert(probe);
    }

    pub fn on_idle_state_change(&self, handler: impl Fn(bool, Duration) + Send + Sync + 'static) {
        self.handlers.idle_change.write().push(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&MonitorError) + Send + Sync + 'static) {
        self.handlers.error.write().push(Arc::new(handler));
    }

    pub fn current_state(&self) -> MonitorState {
        self.state.snapshot()
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    pub fn idle_duration(&self) -> Duration {
        self.state.idle_duration()
    }

    /// Launch the sampling loop and the agent session. Fails when the
    /// monitor is already running. `cancel` stops both tasks; so does
    /// [`Monitor::stop`].
    pub fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let cancel = cancel.child_token();
        let (events_tx, events_rx) = mpsc::channel(16);
        let (refresh_tx, refresh_rx) = mpsc::channel(4);

        let sampler = tokio::spawn(run_sampler(SamplerDeps {
            config: self.config.clone(),
            probes: self.probes.clone(),
            state: self.state.clone(),
            handlers: self.handlers.clone(),
            events_tx,
            refresh_rx,
            cancel: cancel.clone(),
        }));

        let session = tokio::spawn(run_session(SessionDeps {
            config: self.config.clone(),
            state: self.state.clone(),
            handlers: self.handlers.clone(),
            events: events_rx,
            refresh_tx,
            cancel: cancel.clone(),
        }));

        *running = Some(RunningTasks {
            cancel,
            sampler,
            session,
        });
        Ok(())
    }

    /// Cancel and await both tasks.
    pub async fn stop(&self) -> Result<()> {
        let tasks = { self.running.lock().take() }.ok_or(MonitorError::NotRunning)?;
        tasks.cancel.cancel();
        let _ = tasks.sampler.await;
        let _ = tasks.session.await;
        Ok(())
    }
}

struct SamplerDeps {
    config: MonitorConfig,
    probes: Arc<ProbeSet>,
    state: Arc<StateCell>,
    handlers: Arc<Handlers>,
    events_tx: mpsc::Sender<SessionEvent>,
    refresh_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

/// One cooperative task: tick, probe everything, evaluate, transition.
async fn run_sampler(mut deps: SamplerDeps) {
    let mut ticker = tokio::time::interval(deps.config.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // One idle notification per idle epoch; re-armed when the epoch ends.
    let mut notified_this_epoch = false;

    loop {
        tokio::select! {
            _ = deps.cancel.cancelled() => break,
            _ = ticker.tick() => {}
            Some(()) = deps.refresh_rx.recv() => trace!("immediate refresh"),
        }

        for probe in deps.probes.snapshot() {
            let kind = probe.kind();
            match probe.sample().await {
                Ok(value) => deps
                    .state
                    .update_usage(ResourceSample::new(kind, value)),
                // Keep the previous sample for this kind; the loop goes on.
                Err(source) => deps
                    .handlers
                    .fire_error(&MonitorError::Probe { kind, source }),
            }
        }

        let now = Utc::now();
        let idle_now = evaluator::is_idle(&deps.config.thresholds, &deps.state.usage());
        let was_idle = deps.state.is_idle();

        match (was_idle, idle_now) {
            (false, true) => {
                deps.state.enter_idle(now);
                notified_this_epoch = false;
                deps.handlers.fire_idle_change(true, Duration::ZERO);
                report_state_change(&deps, InstanceState::Running, InstanceState::Idle, now);
            }
            (true, false) => {
                deps.state.exit_idle();
                notified_this_epoch = false;
                deps.handlers.fire_idle_change(false, Duration::ZERO);
                report_state_change(&deps, InstanceState::Idle, InstanceState::Running, now);
            }
            (true, true) => {
                let duration = deps.state.refresh_idle_duration(now);
                if duration >= deps.config.nap_time && !notified_this_epoch {
                    let notification = IdleNotification {
                        instance_id: deps.config.instance.instance_id.clone(),
                        idle_since: deps.state.idle_since().unwrap_or(now),
                        idle_duration: duration,
                        resource_usage: deps.state.usage(),
                    };
                    // Marked notified only once the session has it; a full
                    // queue (agent unreachable) retries next tick.
                    if deps
                        .events_tx
                        .try_send(SessionEvent::IdleNotify(notification))
                        .is_ok()
                    {
                        notified_this_epoch = true;
                    }
                }
            }
            (false, false) => {}
        }
    }

    debug!("sampler task finished");
}

/// Queue a state-change report for the session; best-effort, the
/// heartbeat carries the same state anyway.
fn report_state_change(
    deps: &SamplerDeps,
    previous: InstanceState,
    current: InstanceState,
    now: chrono::DateTime<Utc>,
) {
    let report = StateChangeReport {
        instance_id: deps.config.instance.instance_id.clone(),
        previous_state: previous,
        current_state: current,
        timestamp: now,
        reason: match current {
            InstanceState::Idle => "all thresholded resources at or below limits".to_string(),
            _ => "resource activity above threshold".to_string(),
        },
    };
    let _ = deps
        .events_tx
        .try_send(SessionEvent::StateChange(report));
}
