//! Sync client configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::reconnect::ReconnectPolicy;

/// Operator-side sync configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // Endpoints
    pub relay_url: String,
    pub api_url: String,
    /// Bearer token presented when opening the relay transport
    pub relay_token: Option<String>,

    // Connection
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,

    // Session
    pub lease_interval: Duration,
    /// Cap on events waiting for a reconnect; unbounded when unset
    pub outbound_queue_limit: Option<usize>,

    // Logging
    pub log_json: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3002/ws".to_string(),
            api_url: "http://localhost:3001/api".to_string(),
            relay_token: None,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
            lease_interval: Duration::from_millis(5_000),
            outbound_queue_limit: None,
            log_json: false,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_attempts = parse_var("RECONNECT_MAX_ATTEMPTS", defaults.reconnect.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::OutOfRange(
                "RECONNECT_MAX_ATTEMPTS must be at least 1",
            ));
        }

        let base_delay_ms = parse_var(
            "RECONNECT_BASE_DELAY_MS",
            defaults.reconnect.base_delay.as_millis() as u64,
        )?;
        let max_delay_ms = parse_var(
            "RECONNECT_MAX_DELAY_MS",
            defaults.reconnect.max_delay.as_millis() as u64,
        )?;
        if base_delay_ms == 0 || max_delay_ms < base_delay_ms {
            return Err(ConfigError::OutOfRange(
                "RECONNECT_BASE_DELAY_MS must be non-zero and not above RECONNECT_MAX_DELAY_MS",
            ));
        }

        let lease_ms = parse_var(
            "LEASE_RENEWAL_INTERVAL_MS",
            defaults.lease_interval.as_millis() as u64,
        )?;
        if lease_ms == 0 {
            return Err(ConfigError::OutOfRange(
                "LEASE_RENEWAL_INTERVAL_MS must be greater than zero",
            ));
        }

        let outbound_queue_limit = match env::var("SYNC_OUTBOUND_QUEUE_LIMIT") {
            Ok(raw) => {
                let limit: usize = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "SYNC_OUTBOUND_QUEUE_LIMIT",
                    value: raw.clone(),
                })?;
                if limit == 0 {
                    return Err(ConfigError::OutOfRange(
                        "SYNC_OUTBOUND_QUEUE_LIMIT must be at least 1",
                    ));
                }
                Some(limit)
            }
            Err(_) => None,
        };

        Ok(Self {
            relay_url: env::var("RELAY_URL").unwrap_or(defaults.relay_url),
            api_url: env::var("API_URL").unwrap_or(defaults.api_url),
            relay_token: env::var("RELAY_TOKEN").ok().filter(|t| !t.is_empty()),
            reconnect: ReconnectPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                ..defaults.reconnect
            },
            connect_timeout: defaults.connect_timeout,
            max_frame_bytes: defaults.max_frame_bytes,
            lease_interval: Duration::from_millis(lease_ms),
            outbound_queue_limit,
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("Value out of range: {0}")]
    OutOfRange(&'static str),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_config() {
        for name in [
            "RELAY_URL",
            "API_URL",
            "RELAY_TOKEN",
            "RECONNECT_MAX_ATTEMPTS",
            "RECONNECT_BASE_DELAY_MS",
            "RECONNECT_MAX_DELAY_MS",
            "LEASE_RENEWAL_INTERVAL_MS",
            "SYNC_OUTBOUND_QUEUE_LIMIT",
            "LOG_FORMAT",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        cleanup_config();

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.relay_url, "ws://localhost:3002/ws");
        assert_eq!(config.api_url, "http://localhost:3001/api");
        assert_eq!(config.relay_token, None);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.lease_interval, Duration::from_secs(5));
        assert_eq!(config.outbound_queue_limit, None);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        env::set_var("RELAY_URL", "ws://relay.internal/ws");
        env::set_var("RELAY_TOKEN", "secret");
        env::set_var("RECONNECT_MAX_ATTEMPTS", "3");
        env::set_var("RECONNECT_BASE_DELAY_MS", "250");
        env::set_var("SYNC_OUTBOUND_QUEUE_LIMIT", "100");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.relay_url, "ws://relay.internal/ws");
        assert_eq!(config.relay_token.as_deref(), Some("secret"));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.outbound_queue_limit, Some(100));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_rejects_inverted_delays() {
        cleanup_config();
        env::set_var("RECONNECT_BASE_DELAY_MS", "5000");
        env::set_var("RECONNECT_MAX_DELAY_MS", "1000");

        assert!(matches!(
            SyncConfig::from_env(),
            Err(ConfigError::OutOfRange(_))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_rejects_garbage_limit() {
        cleanup_config();
        env::set_var("SYNC_OUTBOUND_QUEUE_LIMIT", "lots");

        assert!(matches!(
            SyncConfig::from_env(),
            Err(ConfigError::Invalid { name: "SYNC_OUTBOUND_QUEUE_LIMIT", .. })
        ));

        cleanup_config();
    }
}
