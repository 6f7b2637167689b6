use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Process configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub database_url: String,
    pub chain_ws_url: String,
    pub consumer_pool_size: usize,
    pub monitor_interval: Duration,
    pub flusher_interval: Duration,
    pub tx_flush_batch_size: usize,
    pub rpc_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let parsed = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                Some(value) => value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::Invalid { name, value }),
                None => Ok(default),
            }
        };

        Ok(Config {
            redis_url: required("REDIS_URL")?,
            database_url: required("DATABASE_URL")?,
            chain_ws_url: required("CHAIN_WS_URL")?,
            consumer_pool_size: parsed("CONSUMER_POOL_SIZE", 10)? as usize,
            monitor_interval: Duration::from_secs(parsed("MONITOR_INTERVAL_SECS", 10)?),
            flusher_interval: Duration::from_secs(parsed("FLUSHER_INTERVAL_SECS", 10)?),
            tx_flush_batch_size: parsed("TX_FLUSH_BATCH_SIZE", 10_000)? as usize,
            rpc_timeout: Duration::from_secs(parsed("RPC_TIMEOUT_SECS", 30)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars(name: &str) -> Option<String> {
        match name {
            "REDIS_URL" => Some("redis://127.0.0.1:6379".to_string()),
            "DATABASE_URL" => Some("postgres://localhost/indexer".to_string()),
            "CHAIN_WS_URL" => Some("wss://example.org".to_string()),
            _ => None,
        }
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let config = Config::from_lookup(base_vars).unwrap();
        assert_eq!(config.consumer_pool_size, 10);
        assert_eq!(config.monitor_interval, Duration::from_secs(10));
        assert_eq!(config.flusher_interval, Duration::from_secs(10));
        assert_eq!(config.tx_flush_batch_size, 10_000);
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let err = Config::from_lookup(|name| match name {
            "REDIS_URL" => None,
            other => base_vars(other),
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("REDIS_URL")));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(|name| match name {
            "CONSUMER_POOL_SIZE" => Some("4".to_string()),
            "MONITOR_INTERVAL_SECS" => Some("3".to_string()),
            other => base_vars(other),
        })
        .unwrap();
        assert_eq!(config.consumer_pool_size, 4);
        assert_eq!(config.monitor_interval, Duration::from_secs(3));
    }

    #[test]
    fn garbage_numeric_value_is_an_error() {
        let err = Config::from_lookup(|name| match name {
            "CONSUMER_POOL_SIZE" => Some("ten".to_string()),
            other => base_vars(other),
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "CONSUMER_POOL_SIZE",
                ..
            }
        ));
    }
}
