//! Network configuration module

use crate::error::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default pub/sub channel every agent joins
pub const DEFAULT_CHANNEL: &str = "agent-network";

/// Retention windows are capped at ten years
const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

/// Default transport URL (in-process broker)
pub const DEFAULT_URL: &str = "memory://default";

/// Top-level configuration for an agent network client.
///
/// Interval accessors never return zero, even for configs that skipped
/// [`NetworkConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub transport: TransportConfig,
    pub registry: RegistryConfig,
    pub coordinator: CoordinatorConfig,
    pub client: ClientConfig,
}

impl NetworkConfig {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> MeshResult<()> {
        let t = &self.transport;
        if t.channel.trim().is_empty() {
            return Err(MeshError::Config("transport.channel must not be empty".into()));
        }
        if t.max_connect_attempts == 0 {
            return Err(MeshError::Config(
                "transport.maxConnectAttempts must be at least 1".into(),
            ));
        }
        if t.backoff_multiplier < 1.0 {
            return Err(MeshError::Config(
                "transport.backoffMultiplier must be >= 1.0".into(),
            ));
        }
        if t.health_check_interval_ms == 0 {
            return Err(MeshError::Config(
                "transport.healthCheckIntervalMs must be positive".into(),
            ));
        }

        let r = &self.registry;
        if !(r.default_decay_factor > 0.0 && r.default_decay_factor <= 1.0) {
            return Err(MeshError::Config(
                "registry.defaultDecayFactor must be in (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.initial_trust) {
            return Err(MeshError::Config("registry.initialTrust must be in [0, 1]".into()));
        }
        if r.agent_timeout_minutes == 0 || r.cleanup_interval_secs == 0 {
            return Err(MeshError::Config(
                "registry timeouts and intervals must be positive".into(),
            ));
        }

        if self.coordinator.sweep_interval_secs == 0 {
            return Err(MeshError::Config(
                "coordinator.sweepIntervalSecs must be positive".into(),
            ));
        }
        if !(1..=1440).contains(&self.coordinator.default_timeout_minutes) {
            return Err(MeshError::Config(
                "coordinator.defaultTimeoutMinutes must be in [1, 1440]".into(),
            ));
        }

        if self.client.presence_interval_secs == 0 || self.client.discovery_interval_secs == 0 {
            return Err(MeshError::Config("client intervals must be positive".into()));
        }
        Ok(())
    }
}

/// Transport (pub/sub connection) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Backend URL: `memory://<name>`, `mesh://<topic>?peer=...` or a raw multiaddr
    pub url: String,
    /// Channel all envelopes are published on
    pub channel: String,
    pub max_connect_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            max_connect_attempts: 5,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl TransportConfig {
    /// Delay before retry number `attempt` (1-based):
    /// `min(base * multiplier^(attempt-1), max)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }
}

/// Agent registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    /// An agent not seen for this long is considered unavailable
    pub agent_timeout_minutes: u64,
    pub cleanup_interval_secs: u64,
    /// Per-day trust decay applied to newly discovered agents
    pub default_decay_factor: f64,
    /// Trust score assigned on first announcement
    pub initial_trust: f64,
    pub max_agents: usize,
    /// Offline agents are dropped after this many hours without being seen
    pub offline_retention_hours: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            agent_timeout_minutes: 5,
            cleanup_interval_secs: 60,
            default_decay_factor: 0.95,
            initial_trust: 0.5,
            max_agents: 10_000,
            offline_retention_hours: 24,
        }
    }
}

impl RegistryConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn offline_retention(&self) -> chrono::Duration {
        retention_hours(self.offline_retention_hours)
    }
}

/// Help request coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    pub sweep_interval_secs: u64,
    /// Requests older than this are purged regardless of status
    pub retention_hours: u64,
    pub default_timeout_minutes: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            retention_hours: 24,
            default_timeout_minutes: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        retention_hours(self.retention_hours)
    }
}

/// Client facade settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub presence_interval_secs: u64,
    pub discovery_interval_secs: u64,
    /// How long shutdown waits for background tasks before aborting them
    pub shutdown_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            presence_interval_secs: 60,
            discovery_interval_secs: 120,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ClientConfig {
    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn retention_hours(hours: u64) -> chrono::Duration {
    chrono::Duration::hours(hours.min(MAX_RETENTION_HOURS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.channel, DEFAULT_CHANNEL);
        assert_eq!(config.registry.initial_trust, 0.5);
    }

    #[test]
    fn test_backoff_delay() {
        let config = TransportConfig {
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(800));
        // Capped
        assert_eq!(config.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = NetworkConfig::default();
        config.registry.default_decay_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.transport.max_connect_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = NetworkConfig::default();
        config.coordinator.default_timeout_minutes = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_camel_case() {
        let json = r#"{"transport": {"channel": "team", "baseDelayMs": 5}}"#;
        let config: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport.channel, "team");
        assert_eq!(config.transport.base_delay_ms, 5);
        assert_eq!(config.transport.max_connect_attempts, 5);
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let mut config = NetworkConfig::default();
        config.transport.health_check_interval_ms = 0;
        config.registry.cleanup_interval_secs = 0;
        config.coordinator.sweep_interval_secs = 0;
        config.client.presence_interval_secs = 0;
        config.client.discovery_interval_secs = 0;
        assert!(config.validate().is_err());

        assert_eq!(config.transport.health_check_interval(), Duration::from_millis(1));
        assert_eq!(config.registry.cleanup_interval(), Duration::from_secs(1));
        assert_eq!(config.coordinator.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.client.presence_interval(), Duration::from_secs(1));
        assert_eq!(config.client.discovery_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_retention_windows() {
        let mut config = NetworkConfig::default();
        assert_eq!(config.registry.offline_retention(), chrono::Duration::hours(24));
        config.coordinator.retention_hours = u64::MAX;
        assert_eq!(
            config.coordinator.retention(),
            chrono::Duration::hours(MAX_RETENTION_HOURS as i64)
        );
    }
}
