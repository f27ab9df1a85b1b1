//! User-input activity from `/proc/interrupts` deltas on input devices.
//!
//! Reports 100 when any keyboard/mouse/touch interrupt fired since the
//! previous sample, 0 otherwise. Headless cloud instances have no input
//! interrupt sources, which correctly reads as permanently quiet.

use async_trait::async_trait;
use parking_lot::Mutex;
use snooze_core::ResourceType;

use super::Probe;

const INPUT_MARKERS: &[&str] = &["i8042", "keyboard", "mouse", "touchpad", "touchscreen"];

pub struct UserInputProbe {
    last: Mutex<Option<u64>>,
}

impl UserInputProbe {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }
}

impl Default for UserInputProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Sum interrupt counts on lines naming an input device.
fn parse_interrupts(content: &str) -> u64 {
    let mut total = 0u64;
    for line in content.lines() {
        let lower = line.to_ascii_lowercase();
        if !INPUT_MARKERS.iter().any(|m| lower.contains(m)) {
            continue;
        }
        total += line
            .split_whitespace()
            .skip(1)
            .map_while(|f| f.parse::<u64>().ok())
            .sum::<u64>();
    }
    total
}

#[async_trait]
impl Probe for UserInputProbe {
    fn kind(&self) -> ResourceType {
        ResourceType::UserInput
    }

    #[cfg(target_os = "linux")]
    async fn sample(&self) -> anyhow::Result<f64> {
        let content = tokio::fs::read_to_string("/proc/interrupts").await?;
        let count = parse_interrupts(&content);

        let mut last = self.last.lock();
        let value = match *last {
            Some(prev) if count > prev => 100.0,
            Some(_) => 0.0,
            None => 0.0,
        };
        *last = Some(count);
        Ok(value)
    }

    #[cfg(not(target_os = "linux"))]
    async fn sample(&self) -> anyhow::Result<f64> {
        Ok(super::UNSUPPORTED_BASELINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERRUPTS: &str = "\
            CPU0       CPU1
   1:        100        200   IO-APIC    1-edge      i8042
   8:          1          0   IO-APIC    8-edge      rtc0
  12:         50         25   IO-APIC   12-edge      i8042
 LOC:     999999     999999   Local timer interrupts
";

    #[test]
    fn test_parse_counts_input_lines_only() {
        assert_eq!(parse_interrupts(INTERRUPTS), 375);
    }

    #[test]
    fn test_parse_no_input_sources() {
        assert_eq!(parse_interrupts("LOC: 5 5 Local timer interrupts\n"), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_live_sample_is_binary() {
        let probe = UserInputProbe::new();
        let value = probe.sample().await.expect("sample");
        assert!(value == 0.0 || value == 100.0);
    }
}
