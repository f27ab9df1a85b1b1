//! CPU utilization from `/proc/stat` jiffy deltas.

use async_trait::async_trait;
use parking_lot::Mutex;
use snooze_core::ResourceType;

use super::Probe;

pub struct CpuProbe {
    last: Mutex<Option<(u64, u64)>>,
}

impl CpuProbe {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the aggregate `cpu` line into `(total, idle)` jiffies.
/// Idle includes iowait.
fn parse_proc_stat(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total, idle))
}

#[async_trait]
impl Probe for CpuProbe {
    fn kind(&self) -> ResourceType {
        ResourceType::Cpu
    }

    #[cfg(target_os = "linux")]
    async fn sample(&self) -> anyhow::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/stat").await?;
        let (total, idle) =
            parse_proc_stat(&content).ok_or_else(|| anyhow::anyhow!("unparsable /proc/stat"))?;

        let mut last = self.last.lock();
        let value = match *last {
            Some((prev_total, prev_idle)) if total > prev_total => {
                let delta_total = (total - prev_total) as f64;
                let delta_idle = idle.saturating_sub(prev_idle) as f64;
                ((delta_total - delta_idle) / delta_total) * 100.0
            }
            // No baseline yet (or counter reset): report quiet and let
            // the next tick produce a real delta.
            _ => 0.0,
        };
        *last = Some((total, idle));
        Ok(value.clamp(0.0, 100.0))
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample(&self) -> anyhow::Result<f64> {
        Ok(super::UNSUPPORTED_BASELINE)
    }
}
