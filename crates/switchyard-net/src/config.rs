//! Swarm configuration

use crate::stats::StatsConfig;
use crate::swarm::SwarmError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of a [`crate::Swarm`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Deadline of a single transport dial attempt
    pub dial_timeout_secs: u64,
    /// Deadline of a whole `connect()` call; 0 disables it
    pub connect_timeout_secs: u64,
    /// Concurrent address dials per peer
    pub per_peer_dial_limit: usize,
    /// Capacity of the event channel
    pub event_capacity: usize,
    /// Traffic statistics
    pub stats: StatsConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 10,
            connect_timeout_secs: 30,
            per_peer_dial_limit: 8,
            event_capacity: 256,
            stats: StatsConfig::default(),
        }
    }
}

impl SwarmConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.dial_timeout_secs == 0 {
            return Err(SwarmError::Configuration("dial timeout must be non-zero".into()));
        }
        if self.per_peer_dial_limit == 0 {
            return Err(SwarmError::Configuration("per-peer dial limit must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(SwarmError::Configuration("event capacity must be non-zero".into()));
        }
        if self.stats.compute_interval_ms == 0 {
            return Err(SwarmError::Configuration("stats interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: SwarmConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SwarmConfig::default());
        assert_eq!(config.dial_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_connect_timeout_disables_deadline() {
        let config: SwarmConfig = serde_json::from_str(r#"{"connect_timeout_secs":0}"#).unwrap();
        assert_eq!(config.connect_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_stats_defaults() {
        let config: SwarmConfig =
            serde_json::from_str(r#"{"stats":{"retained_peers":3}}"#).unwrap();
        assert_eq!(config.stats.retained_peers, 3);
        assert_eq!(config.stats.compute_interval_ms, 2000);

        let config = SwarmConfig {
            stats: StatsConfig {
                compute_interval_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SwarmError::Configuration(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = SwarmConfig {
            per_peer_dial_limit: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SwarmError::Configuration(_))));

        let config = SwarmConfig {
            dial_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SwarmError::Configuration(_))));
    }
}
