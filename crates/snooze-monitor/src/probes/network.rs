//! Network utilization from `/proc/net/dev` byte-counter deltas,
//! expressed as a percentage of a nominal 1 Gbit/s link.

use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use snooze_core::ResourceType;

use super::Probe;

/// 1 Gbit/s in bytes per second; the reference for 100% utilization.
const NOMINAL_BYTES_PER_SEC: f64 = 125_000_000.0;

pub struct NetworkProbe {
    last: Mutex<Option<(Instant, u64)>>,
}

impl NetworkProbe {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum rx+tx bytes over all interfaces except loopback.
fn parse_net_dev(content: &str) -> u64 {
    let mut total = 0u64;
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        // Field 0 is rx bytes, field 8 is tx bytes.
        if fields.len() > 8 {
            total += fields[0] + fields[8];
        }
    }
    total
}

#[async_trait]
impl Probe for NetworkProbe {
    fn kind(&self) -> ResourceType {
        ResourceType::Network
    }

    #[cfg(target_os = "linux")]
    async fn sample(&self) -> anyhow::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/net/dev").await?;
        let bytes = parse_net_dev(&content);
        let now = Instant::now();

        let mut last = self.last.lock();
        let value = match *last {
            Some((prev_at, prev_bytes)) if bytes >= prev_bytes => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    let rate = (bytes - prev_bytes) as f64 / elapsed;
                    (rate / NOMINAL_BYTES_PER_SEC) * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        *last = Some((now, bytes));
        Ok(value.clamp(0.0, 100.0))
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample(&self) -> anyhow::Result<f64> {
        Ok(super::UNSUPPORTED_BASELINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000000    1000    0    0    0     0          0         0  1000000    1000    0    0    0     0       0          0
  eth0: 5000000    4000    0    0    0     0          0         0  3000000    2000    0    0    0     0       0          0
";

    #[test]
    fn test_parse_skips_loopback() {
        assert_eq!(parse_net_dev(NET_DEV), 8_000_000);
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_net_dev(""), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_live_sample_is_in_range() {
        let probe = NetworkProbe::new();
        probe.sample().await.expect("first");
        let value = probe.sample().await.expect("second");
        assert!((0.0..=100.0).contains(&value));
    }
}
