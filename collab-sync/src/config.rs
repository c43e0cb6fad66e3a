//! Server configuration.
//!
//! Every knob has a default; `from_env` overrides them from `COLLAB_*`
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Quiet period after the last applied update before a flush
    pub debounce: Duration,
    /// Documents untouched for this long are flushed and evicted
    pub idle_timeout: Duration,
    /// How often the eviction / session-expiry sweep runs
    pub sweep_interval: Duration,
    /// Lifetime of a connection session
    pub session_ttl: Duration,
    /// Outbound queue depth per connection
    pub channel_capacity: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_frame_bytes: usize,
    /// HS256 secret for access tokens
    pub jwt_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            debounce: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            session_ttl: Duration::from_secs(2 * 60 * 60),
            channel_capacity: 256,
            max_frame_bytes: 8 * 1024 * 1024,
            jwt_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected {expected}, got {value:?}")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl ServerConfig {
    /// Short timers, ephemeral port, in-memory storage.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            debounce: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(250),
            session_ttl: Duration::from_secs(60),
            channel_capacity: 64,
            max_frame_bytes: 1024 * 1024,
            ..Self::default()
        }
    }

    /// Defaults overridden by `COLLAB_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(addr) = get("COLLAB_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = get("COLLAB_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(v) = get("COLLAB_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(parse_u64("COLLAB_DEBOUNCE_MS", &v)?);
        }
        if let Some(v) = get("COLLAB_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(parse_u64("COLLAB_IDLE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("COLLAB_SWEEP_INTERVAL_SECS") {
            let secs = parse_u64("COLLAB_SWEEP_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "COLLAB_SWEEP_INTERVAL_SECS",
                    expected: "a positive integer",
                    value: v,
                });
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("COLLAB_SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(parse_u64("COLLAB_SESSION_TTL_SECS", &v)?);
        }
        if let Some(v) = get("COLLAB_CHANNEL_CAPACITY") {
            let capacity = parse_u64("COLLAB_CHANNEL_CAPACITY", &v)? as usize;
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "COLLAB_CHANNEL_CAPACITY",
                    expected: "a positive integer",
                    value: v,
                });
            }
            config.channel_capacity = capacity;
        }
        if let Some(v) = get("COLLAB_MAX_FRAME_BYTES") {
            let max = parse_u64("COLLAB_MAX_FRAME_BYTES", &v)? as usize;
            if max == 0 {
                return Err(ConfigError::InvalidValue {
                    var: "COLLAB_MAX_FRAME_BYTES",
                    expected: "a positive integer",
                    value: v,
                });
            }
            config.max_frame_bytes = max;
        }
        if let Some(secret) = get("COLLAB_JWT_SECRET") {
            config.jwt_secret = Some(secret);
        }
        Ok(config)
    }
}

fn parse_u64(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "an unsigned integer",
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.debounce, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.max_frame_bytes, 8 * 1024 * 1024);
        assert!(config.storage_path.is_none());
        assert!(config.jwt_secret.is_none());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("COLLAB_BIND_ADDR", "0.0.0.0:8080"),
            ("COLLAB_STORAGE_PATH", "/var/lib/collab"),
            ("COLLAB_DEBOUNCE_MS", "500"),
            ("COLLAB_IDLE_TIMEOUT_SECS", "120"),
            ("COLLAB_SESSION_TTL_SECS", "3600"),
            ("COLLAB_CHANNEL_CAPACITY", "32"),
            ("COLLAB_MAX_FRAME_BYTES", "65536"),
            ("COLLAB_JWT_SECRET", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/collab")));
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.channel_capacity, 32);
        assert_eq!(config.max_frame_bytes, 65_536);
        assert_eq!(config.jwt_secret.as_deref(), Some("s3cret"));
        // untouched
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_empty_values_ignored() {
        let config = ServerConfig::from_lookup(lookup(&[("COLLAB_STORAGE_PATH", "  ")])).unwrap();
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let err = ServerConfig::from_lookup(lookup(&[("COLLAB_DEBOUNCE_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "COLLAB_DEBOUNCE_MS",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(ServerConfig::from_lookup(lookup(&[("COLLAB_CHANNEL_CAPACITY", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("COLLAB_SWEEP_INTERVAL_SECS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("COLLAB_MAX_FRAME_BYTES", "0")])).is_err());
    }
}
