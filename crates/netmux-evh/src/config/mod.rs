//! Event handler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use netmux_evh::config::EvhConfig;
//!
//! // Defaults with env overrides
//! let config = EvhConfig::from_env();
//!
//! // Or customize programmatically
//! let config = EvhConfig::from_env()
//!     .workers(8)
//!     .poll_interval(Duration::from_millis(5));
//! ```

pub mod defaults;

use std::time::Duration;

use netmux_core::env::env_get;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct EvhConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Event records fetched per wait
    pub max_events: usize,
    /// Per-worker read buffer size in bytes
    pub read_buffer: usize,
    /// Listen backlog
    pub backlog: i32,
    /// Longest a wait blocks before the inbox and stop flag are checked
    pub poll_interval: Duration,
    /// Connection slots per worker
    pub max_connections: usize,
    /// Queued output bytes per connection before the worker stops reading it
    pub max_queued: usize,
}

impl Default for EvhConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EvhConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NMX_WORKERS` - Number of worker threads
    /// - `NMX_MAX_EVENTS` - Event records per wait
    /// - `NMX_READ_BUFFER` - Read buffer bytes
    /// - `NMX_BACKLOG` - Listen backlog
    /// - `NMX_POLL_INTERVAL_MS` - Poll interval in milliseconds
    /// - `NMX_MAX_CONNECTIONS` - Connection slots per worker
    /// - `NMX_MAX_QUEUED` - Queued output bytes per connection before reads pause
    pub fn from_env() -> Self {
        Self {
            workers: env_get("NMX_WORKERS", defaults::WORKERS),
            max_events: env_get("NMX_MAX_EVENTS", defaults::MAX_EVENTS),
            read_buffer: env_get("NMX_READ_BUFFER", defaults::READ_BUFFER),
            backlog: env_get("NMX_BACKLOG", defaults::BACKLOG),
            poll_interval: Duration::from_millis(env_get(
                "NMX_POLL_INTERVAL_MS",
                defaults::POLL_INTERVAL_MS,
            )),
            max_connections: env_get("NMX_MAX_CONNECTIONS", defaults::MAX_CONNECTIONS),
            max_queued: env_get("NMX_MAX_QUEUED", defaults::MAX_QUEUED),
        }
    }

    /// Create config with explicit defaults (no env override).
    pub fn new() -> Self {
        Self {
            workers: defaults::WORKERS,
            max_events: defaults::MAX_EVENTS,
            read_buffer: defaults::READ_BUFFER,
            backlog: defaults::BACKLOG,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            max_connections: defaults::MAX_CONNECTIONS,
            max_queued: defaults::MAX_QUEUED,
        }
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_queued(mut self, bytes: usize) -> Self {
        self.max_queued = bytes;
        self
    }

    /// Poll interval as a wait timeout.
    pub(crate) fn poll_ms(&self) -> i64 {
        self.poll_interval.as_millis().min(i64::MAX as u128) as i64
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue("workers must be > 0"));
        }
        if self.workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("workers must be <= 256"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.read_buffer < 512 {
            return Err(ConfigError::InvalidValue("read_buffer must be >= 512"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("poll_interval must be > 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be > 0"));
        }
        if self.max_queued == 0 {
            return Err(ConfigError::InvalidValue("max_queued must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EvhConfig::new();
        assert_eq!(config.workers, defaults::WORKERS);
        assert_eq!(config.poll_ms(), defaults::POLL_INTERVAL_MS as i64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EvhConfig::new()
            .workers(8)
            .max_events(32)
            .poll_interval(Duration::from_millis(5));

        assert_eq!(config.workers, 8);
        assert_eq!(config.max_events, 32);
        assert_eq!(config.poll_ms(), 5);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("NMX_MAX_CONNECTIONS", "77");
        std::env::set_var("NMX_MAX_QUEUED", "4096");
        let config = EvhConfig::from_env();
        std::env::remove_var("NMX_MAX_CONNECTIONS");
        std::env::remove_var("NMX_MAX_QUEUED");
        assert_eq!(config.max_connections, 77);
        assert_eq!(config.max_queued, 4096);
    }

    #[test]
    fn test_validation() {
        assert!(EvhConfig::new().workers(0).validate().is_err());
        assert!(EvhConfig::new().workers(1000).validate().is_err());
        assert!(EvhConfig::new().read_buffer(16).validate().is_err());
        assert!(EvhConfig::new().max_queued(0).validate().is_err());
        assert_eq!(
            EvhConfig::new().poll_interval(Duration::ZERO).validate(),
            Err(ConfigError::InvalidValue("poll_interval must be > 0"))
        );
    }
}
