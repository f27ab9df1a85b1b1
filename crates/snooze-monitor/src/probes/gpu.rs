//! GPU utilization via `nvidia-smi`.
//!
//! Hosts without the tool (or without a GPU) report the baseline; the
//! first failed invocation latches unavailability so the probe never
//! keeps spawning a missing binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use snooze_core::ResourceType;
use tokio::process::Command;
use tracing::debug;

use super::Probe;

const SMI_TIMEOUT: Duration = Duration::from_secs(2);

pub struct GpuProbe {
    unavailable: AtomicBool,
}

impl GpuProbe {
    pub fn new() -> Self {
        Self {
            unavailable: AtomicBool::new(false),
        }
    }
}

impl Default for GpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Highest utilization across GPUs, from `nvidia-smi` CSV output.
fn parse_smi_output(output: &str) -> Option<f64> {
    output
        .lines()
        .filter_map(|l| l.trim().parse::<f64>().ok())
        .fold(None, |max, v| Some(max.map_or(v, |m: f64| m.max(v))))
}

#[async_trait]
impl Probe for GpuProbe {
    fn kind(&self) -> ResourceType {
        ResourceType::Gpu
    }

    async fn sample(&self) -> anyhow::Result<f64> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Ok(super::UNSUPPORTED_BASELINE);
        }

        let result = tokio::time::timeout(
            SMI_TIMEOUT,
            Command::new("nvidia-smi")
                .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                Ok(parse_smi_output(&text)
                    .unwrap_or(super::UNSUPPORTED_BASELINE)
                    .clamp(0.0, 100.0))
            }
            _ => {
                debug!("nvidia-smi unavailable, gpu probe reports baseline from now on");
                self.unavailable.store(true, Ordering::Relaxed);
                Ok(super::UNSUPPORTED_BASELINE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_takes_busiest_gpu() {
        assert_eq!(parse_smi_output("13\n87\n5\n"), Some(87.0));
        assert_eq!(parse_smi_output(" 42 \n"), Some(42.0));
    }

    #[test]
    fn test_parse_empty_or_garbage() {
        assert_eq!(parse_smi_output(""), None);
        assert_eq!(parse_smi_output("N/A\n"), None);
    }

    #[tokio::test]
    async fn test_sample_never_errors() {
        // With or without a GPU present this probe must stay quiet.
        let probe = GpuProbe::new();
        let value = probe.sample().await.expect("gpu probe must not error");
        assert!((0.0..=100.0).contains(&value));
    }
}
