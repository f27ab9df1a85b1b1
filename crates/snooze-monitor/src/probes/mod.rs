//! Resource probes.
//!
//! A probe measures one resource kind as a utilization percentage in
//! `[0, 100]`. Built-in probes read `/proc` on Linux and fall back to a
//! fixed baseline elsewhere, so a monitor never errors out just because
//! the host OS is exotic. Every probe is wrapped in a one-second rate
//! limiter: ticks faster than that reuse the last value.

mod cpu;
mod disk;
mod gpu;
mod memory;
mod network;
mod user_input;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use snooze_core::ResourceType;

pub use cpu::CpuProbe;
pub use disk::DiskProbe;
pub use gpu::GpuProbe;
pub use memory::MemoryProbe;
pub use network::NetworkProbe;
pub use user_input::UserInputProbe;

/// Minimum spacing between real samples of one probe.
pub const PROBE_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Utilization reported on platforms where a probe has no real
/// implementation.
pub(crate) const UNSUPPORTED_BASELINE: f64 = 0.0;

#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ResourceType;

    /// One measurement in `[0, 100]`.
    async fn sample(&self) -> anyhow::Result<f64>;
}

/// Adapter turning a plain closure into a probe; the vehicle for custom
/// probes registered by name.
pub struct FnProbe {
    kind: ResourceType,
    f: Box<dyn Fn() -> anyhow::Result<f64> + Send + Sync>,
}

impl FnProbe {
    pub fn new(
        kind: ResourceType,
        f: impl Fn() -> anyhow::Result<f64> + Send + Sync + 'static,
    ) -> Self {
        Self { kind, f: Box::new(f) }
    }
}

#[async_trait]
impl Probe for FnProbe {
    fn kind(&self) -> ResourceType {
        self.kind.clone()
    }

    async fn sample(&self) -> anyhow::Result<f64> {
        (self.f)()
    }
}

/// Rate-limiting wrapper: at most one real sample per
/// [`PROBE_MIN_INTERVAL`], short-circuiting to the cached value between.
pub struct RateLimited {
    inner: Arc<dyn Probe>,
    min_interval: Duration,
    last: Mutex<Option<(Instant, f64)>>,
}

impl RateLimited {
    pub fn new(inner: Arc<dyn Probe>) -> Self {
        Self::with_interval(inner, PROBE_MIN_INTERVAL)
    }

    pub fn with_interval(inner: Arc<dyn Probe>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> ResourceType {
        self.inner.kind()
    }

    pub async fn sample(&self) -> anyhow::Result<f64> {
        if let Some((at, value)) = *self.last.lock() {
            if at.elapsed() < self.min_interval {
                return Ok(value);
            }
        }

        let value = self.inner.sample().await?;
        *self.last.lock() = Some((Instant::now(), value));
        Ok(value)
    }
}

/// The monitor's probe registry: built-ins plus custom registrations.
pub struct ProbeSet {
    probes: RwLock<HashMap<ResourceType, Arc<RateLimited>>>,
}

impl ProbeSet {
    pub fn empty() -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
        }
    }

    /// All built-in probes for this host.
    pub fn with_builtins() -> Self {
        let set = Self::empty();
        set.insert(Arc::new(CpuProbe::new()));
        set.insert(Arc::new(MemoryProbe));
        set.insert(Arc::new(NetworkProbe::new()));
        set.insert(Arc::new(DiskProbe::new()));
        set.insert(Arc::new(UserInputProbe::new()));
        set.insert(Arc::new(GpuProbe::new()));
        set
    }

    /// Register (or replace) the probe for its kind.
    pub fn insert(&self, probe: Arc<dyn Probe>) {
        let kind = probe.kind();
        self.probes
            .write()
            .insert(kind, Arc::new(RateLimited::new(probe)));
    }

    pub fn kinds(&self) -> Vec<ResourceType> {
        let mut kinds: Vec<_> = self.probes.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn snapshot(&self) -> Vec<Arc<RateLimited>> {
        self.probes.read().values().cloned().collect()
    }
}
