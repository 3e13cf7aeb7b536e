//! Configuration management

use crate::framer::MAX_MESSAGE_LEN;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Registry and connect settings
    pub connection: ConnectionConfig,
    /// Reconnection backoff
    pub backoff: BackoffConfig,
    /// Idle detection on established connections
    pub liveness: LivenessConfig,
    /// Line and queue limits
    pub buffers: BufferConfig,
    /// Poll loop settings
    pub poll: PollConfig,
}

/// Registry and connect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Maximum number of connections the registry holds
    pub max_connections: usize,
    /// Time allowed for one connect attempt across all resolved addresses
    pub connect_timeout_ms: u64,
}

/// Reconnection backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Multiplier applied to each subsequent retry
    pub backoff_factor: f64,
    /// Upper bound on the retry delay, 0 for unbounded growth
    pub max_delay_ms: u64,
}

/// Idle detection on established connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Idle time after which a connection is considered degraded
    pub ping_threshold_ms: u64,
    /// Interval between repeated ping notifications while degraded
    pub ping_refresh_ms: u64,
    /// Idle time after which a connection is considered lost
    pub ping_timeout_ms: u64,
}

/// Line and queue limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum content bytes of one socket line, and of one outbound message
    pub max_line_length: usize,
    /// Maximum content bytes of one line read from standard input
    pub input_max_line_length: usize,
    /// Maximum bytes waiting in a connection's send queue
    pub sendq_max: usize,
}

/// Poll loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Upper bound on a single cycle's wait
    pub max_wait_ms: u64,
    /// Readiness events fetched per cycle
    pub events_capacity: usize,
    /// Whether standard input is part of the wait-set
    pub watch_stdin: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connect_timeout_ms: 15_000,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_threshold_ms: 150_000,
            ping_refresh_ms: 5_000,
            ping_timeout_ms: 300_000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_line_length: MAX_MESSAGE_LEN,
            input_max_line_length: MAX_MESSAGE_LEN,
            sendq_max: 65_536,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 200,
            events_capacity: 128,
            watch_stdin: true,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        match self.max_delay_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl LivenessConfig {
    pub fn ping_threshold(&self) -> Duration {
        Duration::from_millis(self.ping_threshold_ms)
    }

    pub fn ping_refresh(&self) -> Duration {
        Duration::from_millis(self.ping_refresh_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl PollConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl NetConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be positive".to_string()));
        }

        let backoff = &self.backoff;
        if backoff.base_delay_ms == 0 {
            return Err(Error::Config("base_delay_ms must be positive".to_string()));
        }

        if !backoff.backoff_factor.is_finite() || backoff.backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff_factor must be a finite number >= 1.0, got {}",
                backoff.backoff_factor
            )));
        }

        if let Some(max) = backoff.max_delay() {
            if max < backoff.base_delay() {
                return Err(Error::Config(format!(
                    "max_delay_ms ({}) is below base_delay_ms ({})",
                    backoff.max_delay_ms, backoff.base_delay_ms
                )));
            }
        }

        let liveness = &self.liveness;
        if liveness.ping_threshold_ms == 0 || liveness.ping_refresh_ms == 0 {
            return Err(Error::Config("ping intervals must be positive".to_string()));
        }

        if liveness.ping_timeout_ms <= liveness.ping_threshold_ms {
            return Err(Error::Config(format!(
                "ping_timeout_ms ({}) must exceed ping_threshold_ms ({})",
                liveness.ping_timeout_ms, liveness.ping_threshold_ms
            )));
        }

        let buffers = &self.buffers;
        for (name, len) in [
            ("max_line_length", buffers.max_line_length),
            ("input_max_line_length", buffers.input_max_line_length),
        ] {
            if len == 0 || len > MAX_MESSAGE_LEN {
                return Err(Error::Config(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_MESSAGE_LEN, len
                )));
            }
        }

        // one full line plus CRLF must always fit
        if buffers.sendq_max < buffers.max_line_length + 2 {
            return Err(Error::Config(format!(
                "sendq_max ({}) cannot hold a single line",
                buffers.sendq_max
            )));
        }

        if self.poll.max_wait_ms == 0 || self.poll.events_capacity == 0 {
            return Err(Error::Config("poll settings must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(NetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NetConfig = toml::from_str(
            r#"
            [backoff]
            base_delay_ms = 500
            backoff_factor = 1.5

            [poll]
            watch_stdin = false
            "#,
        )
        .unwrap();

        assert_eq!(config.backoff.base_delay_ms, 500);
        assert_eq!(config.backoff.backoff_factor, 1.5);
        assert_eq!(config.backoff.max_delay(), Some(Duration::from_secs(300)));
        assert!(!config.poll.watch_stdin);
        assert_eq!(config.connection.max_connections, 8);
        assert_eq!(config.buffers.max_line_length, MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let mut config = NetConfig::default();
        config.backoff.backoff_factor = 0.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_line_length_above_rfc_limit() {
        let mut config = NetConfig::default();
        config.buffers.max_line_length = MAX_MESSAGE_LEN + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_timeout_below_threshold() {
        let mut config = NetConfig::default();
        config.liveness.ping_timeout_ms = config.liveness.ping_threshold_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ircnet.toml");

        let mut config = NetConfig::default();
        config.connection.max_connections = 3;
        config.backoff.max_delay_ms = 0;
        config.to_file(&path).unwrap();

        let loaded = NetConfig::from_file(&path).unwrap();
        assert_eq!(loaded.connection.max_connections, 3);
        assert_eq!(loaded.backoff.max_delay(), None);
    }
}
