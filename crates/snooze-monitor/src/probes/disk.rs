//! Disk utilization from `/proc/diskstats` I/O-time deltas.
//!
//! Field 13 of a diskstats line is milliseconds spent doing I/O, so the
//! delta over the sampling gap is a direct busy percentage.

use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use snooze_core::ResourceType;

use super::Probe;

pub struct DiskProbe {
    last: Mutex<Option<(Instant, u64)>>,
}

impl DiskProbe {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }
}

impl Default for DiskProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum io-time milliseconds over physical devices (loop and ram devices
/// excluded; partitions are skipped in favor of their parent disk).
fn parse_diskstats(content: &str) -> u64 {
    let mut total = 0u64;
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 13 {
            continue;
        }
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        // Skip partitions (sda1, nvme0n1p2); whole-disk stats already
        // include them.
        if name
            .chars()
            .last()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
            && (name.starts_with("sd") || name.contains('p'))
            && !name.starts_with("nvme")
        {
            continue;
        }
        if let Ok(io_ms) = fields[12].parse::<u64>() {
            total += io_ms;
        }
    }
    total
}

#[async_trait]
impl Probe for DiskProbe {
    fn kind(&self) -> ResourceType {
        ResourceType::Disk
    }

    #[cfg(target_os = "linux")]
    async fn sample(&self) -> anyhow::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/diskstats").await?;
        let io_ms = parse_diskstats(&content);
        let now = Instant::now();

        let mut last = self.last.lock();
        let value = match *last {
            Some((prev_at, prev_ms)) if io_ms >= prev_ms => {
                let elapsed_ms = now.duration_since(prev_at).as_millis() as f64;
                if elapsed_ms > 0.0 {
                    (io_ms - prev_ms) as f64 / elapsed_ms * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        *last = Some((now, io_ms));
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

    const DISKSTATS: &str = "\
   8       0 sda 1000 0 8000 500 2000 0 16000 700 0 1200 1200
   8       1 sda1 900 0 7000 450 1900 0 15000 650 0 1100 1100
   7       0 loop0 10 0 80 5 0 0 0 0 0 5 5
";

    #[test]
    fn test_parse_sums_whole_disks_only() {
        // sda counts; sda1 (partition) and loop0 are skipped.
        assert_eq!(parse_diskstats(DISKSTATS), 1200);
    }

    #[test]
    fn test_parse_short_lines_ignored() {
        assert_eq!(parse_diskstats("8 0 sda 1 2 3\n"), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_live_sample_is_in_range() {
        let probe = DiskProbe::new();
        probe.sample().await.expect("first");
        let value = probe.sample().await.expect("second");
        assert!((0.0..=100.0).contains(&value));
    }
}
