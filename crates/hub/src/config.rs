//! Relay hub configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Relay hub configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Relay
    /// Frames buffered per connection before a slow reader is dropped
    pub outbound_queue_capacity: usize,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,

    // Logging
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3002".to_string(),
            outbound_queue_capacity: 256,
            handshake_timeout: Duration::from_millis(10_000),
            max_frame_bytes: 64 * 1024,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let outbound_queue_capacity =
            parse_var("RELAY_OUTBOUND_QUEUE_CAPACITY", defaults.outbound_queue_capacity)?;
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::OutOfRange(
                "RELAY_OUTBOUND_QUEUE_CAPACITY must be at least 1",
            ));
        }

        let handshake_timeout_ms = parse_var(
            "RELAY_HANDSHAKE_TIMEOUT_MS",
            defaults.handshake_timeout.as_millis() as u64,
        )?;
        if handshake_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange(
                "RELAY_HANDSHAKE_TIMEOUT_MS must be greater than zero",
            ));
        }

        let max_frame_bytes = parse_var("RELAY_MAX_FRAME_BYTES", defaults.max_frame_bytes)?;
        if max_frame_bytes < 256 {
            return Err(ConfigError::OutOfRange(
                "RELAY_MAX_FRAME_BYTES must be at least 256",
            ));
        }

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            outbound_queue_capacity,
            handshake_timeout: Duration::from_millis(handshake_timeout_ms),
            max_frame_bytes,
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
        env::remove_var("BIND_ADDRESS");
        env::remove_var("RELAY_OUTBOUND_QUEUE_CAPACITY");
        env::remove_var("RELAY_HANDSHAKE_TIMEOUT_MS");
        env::remove_var("RELAY_MAX_FRAME_BYTES");
        env::remove_var("LOG_FORMAT");
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        cleanup_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3002");
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, 65536);
        assert!(!config.log_json);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        env::set_var("BIND_ADDRESS", "127.0.0.1:4000");
        env::set_var("RELAY_OUTBOUND_QUEUE_CAPACITY", "8");
        env::set_var("RELAY_HANDSHAKE_TIMEOUT_MS", "250");
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:4000");
        assert_eq!(config.outbound_queue_capacity, 8);
        assert_eq!(config.handshake_timeout, Duration::from_millis(250));
        assert!(config.log_json);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_rejects_garbage_and_zero() {
        cleanup_config();

        env::set_var("RELAY_OUTBOUND_QUEUE_CAPACITY", "lots");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "RELAY_OUTBOUND_QUEUE_CAPACITY",
                ..
            })
        ));

        env::set_var("RELAY_OUTBOUND_QUEUE_CAPACITY", "0");
        assert!(matches!(Config::from_env(), Err(ConfigError::OutOfRange(_))));

        env::remove_var("RELAY_OUTBOUND_QUEUE_CAPACITY");
        env::set_var("RELAY_MAX_FRAME_BYTES", "16");
        assert!(matches!(Config::from_env(), Err(ConfigError::OutOfRange(_))));

        cleanup_config();
    }
}
