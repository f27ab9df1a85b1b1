//! Agent configuration.

use std::time::Duration;

/// Settings for one agent process. Environment overrides follow the
/// `SNOOZE_*` contract; everything has a workable default.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `host:port` the RPC server binds.
    pub bind_addr: String,
    /// Interval handed to monitors at registration.
    pub heartbeat_interval: Duration,
    /// Heartbeats missed (as a multiple of the interval) before a record
    /// is considered disconnected.
    pub stale_multiplier: u32,
    /// Provider stop retry budget.
    pub stop_retry_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub stop_retry_base_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7737".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            stale_multiplier: 3,
            stop_retry_attempts: 5,
            stop_retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("SNOOZE_AGENT_BIND") {
            config.bind_addr = addr;
        }
        if let Some(secs) = std::env::var("SNOOZE_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        config
    }

    /// Age after which a silent record is marked disconnected.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * self.stale_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_window_is_three_intervals() {
        let config = AgentConfig::default();
        assert_eq!(config.stale_after(), config.heartbeat_interval * 3);
    }
}
