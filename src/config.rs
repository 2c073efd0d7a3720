//! Broker configuration
//!
//! Every field has a serde default, so a partial config file or an empty
//! environment still yields a usable broker.

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which pending waiters a publish wakes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakePolicy {
    /// Wake every waiter on the tenant; each re-filters and may get nothing
    #[default]
    Broadcast,
    /// Wake only waiters that have at least one matching event
    Matching,
}

impl FromStr for WakePolicy {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Self::Broadcast),
            "matching" => Ok(Self::Matching),
            other => Err(BrokerError::Config(format!(
                "Unknown wake policy '{}', expected 'broadcast' or 'matching'",
                other
            ))),
        }
    }
}

impl fmt::Display for WakePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Matching => f.write_str("matching"),
        }
    }
}

/// Tunables for a `Broker`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Per-tenant queue capacity before drop-oldest (default: 200)
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,

    /// Maximum age of a buffered envelope in milliseconds (default: 25s)
    #[serde(default = "default_event_ttl_ms")]
    pub event_ttl_ms: u64,

    /// Maximum suspension time per wait call in milliseconds (default: 25s)
    #[serde(default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,

    /// Cap on concurrent pending waiters per tenant (default: 5000)
    #[serde(default = "default_max_waiters_per_tenant")]
    pub max_waiters_per_tenant: usize,

    /// Idle time before an empty tenant buffer is reclaimed, and the
    /// sweep interval, in milliseconds (default: 120s)
    #[serde(default = "default_idle_evict_ms")]
    pub idle_evict_ms: u64,

    /// Which waiters a publish wakes (default: broadcast)
    #[serde(default)]
    pub wake_policy: WakePolicy,
}

fn default_max_buffer_size() -> usize {
    200
}

fn default_event_ttl_ms() -> u64 {
    25_000
}

fn default_long_poll_timeout_ms() -> u64 {
    25_000
}

fn default_max_waiters_per_tenant() -> usize {
    5_000
}

fn default_idle_evict_ms() -> u64 {
    120_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            event_ttl_ms: default_event_ttl_ms(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
            max_waiters_per_tenant: default_max_waiters_per_tenant(),
            idle_evict_ms: default_idle_evict_ms(),
            wake_policy: WakePolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from process environment variables
    ///
    /// Recognizes `MAX_BUFFER_SIZE`, `EVENT_TTL_MS`, `LONG_POLL_TIMEOUT_MS`,
    /// `MAX_WAITERS_PER_TENANT`, `IDLE_EVICT_MS` and `WAKE_POLICY`. Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "MAX_BUFFER_SIZE")? {
            config.max_buffer_size = v;
        }
        if let Some(v) = parse_var(&lookup, "EVENT_TTL_MS")? {
            config.event_ttl_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "LONG_POLL_TIMEOUT_MS")? {
            config.long_poll_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_WAITERS_PER_TENANT")? {
            config.max_waiters_per_tenant = v;
        }
        if let Some(v) = parse_var(&lookup, "IDLE_EVICT_MS")? {
            config.idle_evict_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "WAKE_POLICY")? {
            config.wake_policy = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the broker unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(BrokerError::Config(
                "max_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.event_ttl_ms == 0 {
            return Err(BrokerError::Config(
                "event_ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.long_poll_timeout_ms == 0 {
            return Err(BrokerError::Config(
                "long_poll_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.idle_evict_ms == 0 {
            return Err(BrokerError::Config(
                "idle_evict_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn with_event_ttl(mut self, ttl: Duration) -> Self {
        self.event_ttl_ms = duration_ms(ttl);
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_max_waiters_per_tenant(mut self, max: usize) -> Self {
        self.max_waiters_per_tenant = max;
        self
    }

    pub fn with_idle_evict(mut self, idle: Duration) -> Self {
        self.idle_evict_ms = duration_ms(idle);
        self
    }

    pub fn with_wake_policy(mut self, policy: WakePolicy) -> Self {
        self.wake_policy = policy;
        self
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::from_millis(self.event_ttl_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn idle_evict(&self) -> Duration {
        Duration::from_millis(self.idle_evict_ms)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            BrokerError::Config(format!("Invalid value '{}' for {}: {}", raw, key, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_buffer_size, 200);
        assert_eq!(config.event_ttl(), Duration::from_secs(25));
        assert_eq!(config.long_poll_timeout(), Duration::from_secs(25));
        assert_eq!(config.max_waiters_per_tenant, 5_000);
        assert_eq!(config.idle_evict(), Duration::from_secs(120));
        assert_eq!(config.wake_policy, WakePolicy::Broadcast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = BrokerConfig::from_lookup(lookup(&[
            ("MAX_BUFFER_SIZE", "3"),
            ("EVENT_TTL_MS", "1000"),
            ("LONG_POLL_TIMEOUT_MS", " 500 "),
            ("MAX_WAITERS_PER_TENANT", "10"),
            ("IDLE_EVICT_MS", "2000"),
            ("WAKE_POLICY", "Matching"),
        ]))
        .unwrap();

        assert_eq!(config.max_buffer_size, 3);
        assert_eq!(config.event_ttl_ms, 1000);
        assert_eq!(config.long_poll_timeout_ms, 500);
        assert_eq!(config.max_waiters_per_tenant, 10);
        assert_eq!(config.idle_evict_ms, 2000);
        assert_eq!(config.wake_policy, WakePolicy::Matching);
    }

    #[test]
    fn test_from_lookup_empty_keeps_defaults() {
        let config = BrokerConfig::from_lookup(lookup(&[("EVENT_TTL_MS", "")])).unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = BrokerConfig::from_lookup(lookup(&[("MAX_BUFFER_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("MAX_BUFFER_SIZE"));

        let err = BrokerConfig::from_lookup(lookup(&[("WAKE_POLICY", "sometimes")])).unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(BrokerConfig::default().with_max_buffer_size(0).validate().is_err());
        assert!(BrokerConfig::default()
            .with_event_ttl(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BrokerConfig::from_lookup(lookup(&[("IDLE_EVICT_MS", "0")])).is_err());
    }

    #[test]
    fn test_config_deserialize_partial() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"maxBufferSize": 50, "wakePolicy": "matching"}"#).unwrap();
        assert_eq!(config.max_buffer_size, 50);
        assert_eq!(config.event_ttl_ms, 25_000);
        assert_eq!(config.wake_policy, WakePolicy::Matching);
    }

    #[test]
    fn test_builder_setters() {
        let config = BrokerConfig::default()
            .with_long_poll_timeout(Duration::from_millis(200))
            .with_idle_evict(Duration::from_secs(1))
            .with_max_waiters_per_tenant(2);
        assert_eq!(config.long_poll_timeout_ms, 200);
        assert_eq!(config.idle_evict_ms, 1000);
        assert_eq!(config.max_waiters_per_tenant, 2);
    }
}
