//! Transport settings.

use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7777;

pub const ENV_HOST: &str = "MEMPROF_HOST";
pub const ENV_PORT: &str = "MEMPROF_PORT";
pub const ENV_INTERVAL_MS: &str = "MEMPROF_INTERVAL_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid port {value:?}")]
    InvalidPort { var: &'static str, value: String },
    #[error("{var}: invalid interval {value:?} (expected a positive number of milliseconds)")]
    InvalidInterval { var: &'static str, value: String },
    #[error("{var}: host must not be empty")]
    EmptyHost { var: &'static str },
}

/// Where to connect and how often to talk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Time between `SUMMARY` frames.
    pub metrics_interval: Duration,
    /// First delay after a failed connection attempt.
    pub backoff_initial: Duration,
    /// The delay doubles after each failure up to this value.
    pub backoff_max: Duration,
    /// Longest single wait while connected; bounds how long `stop` waits for
    /// the worker to notice.
    pub poll_tick: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_millis(2000),
            metrics_interval: Duration::from_millis(200),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_millis(3000),
            poll_tick: Duration::from_millis(50),
        }
    }
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TransportConfig {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults overridden by `MEMPROF_HOST`, `MEMPROF_PORT` and
    /// `MEMPROF_INTERVAL_MS` where set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup(ENV_HOST) {
            let host = host.trim();
            if host.is_empty() {
                return Err(ConfigError::EmptyHost { var: ENV_HOST });
            }
            config.host = host.to_owned();
        }

        if let Some(port) = lookup(ENV_PORT) {
            config.port = match port.trim().parse::<u16>() {
                Ok(p) if p != 0 => p,
                _ => {
                    return Err(ConfigError::InvalidPort {
                        var: ENV_PORT,
                        value: port,
                    })
                }
            };
        }

        if let Some(interval) = lookup(ENV_INTERVAL_MS) {
            config.metrics_interval = match interval.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::InvalidInterval {
                        var: ENV_INTERVAL_MS,
                        value: interval,
                    })
                }
            };
        }

        Ok(config)
    }

    /// The delay to use after `current` failed again.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.backoff_max)
    }
}
