//! Memory utilization from `/proc/meminfo`.

use async_trait::async_trait;
use snooze_core::ResourceType;

use super::Probe;

pub struct MemoryProbe;

/// Used fraction from MemTotal/MemAvailable, as a percentage.
fn parse_meminfo(content: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next()?.parse::<f64>().ok(),
            Some("MemAvailable:") => available = parts.next()?.parse::<f64>().ok(),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }

    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

#[async_trait]
impl Probe for MemoryProbe {
    fn kind(&self) -> ResourceType {
        ResourceType::Memory
    }

    #[cfg(target_os = "linux")]
    async fn sample(&self) -> anyhow::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/meminfo").await?;
        parse_meminfo(&content).ok_or_else(|| anyhow::anyhow!("unparsable /proc/meminfo"))
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample(&self) -> anyhow::Result<f64> {
        Ok(super::UNSUPPORTED_BASELINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000000 kB\n\
                       MemFree:         2000000 kB\n\
                       MemAvailable:   12000000 kB\n";
        let used = parse_meminfo(content).expect("parse");
        assert!((used - 25.0).abs() < 0.001, "got {}", used);
    }

    #[test]
    fn test_parse_meminfo_missing_fields() {
        assert!(parse_meminfo("MemTotal: 16000000 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_live_sample_is_in_range() {
        let value = MemoryProbe.sample().await.expect("sample");
        assert!((0.0..=100.0).contains(&value));
    }
}
