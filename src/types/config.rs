//! Configuration structures.
//!
//! Every tunable is an explicit value handed to a `Server`, `Channel` or
//! `Connection` at construction; nothing is read from process globals.
//! Configuration can also be loaded from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Code, Error, Result};

/// Default maximum message size in either direction (4 MiB).
pub const DEFAULT_MAX_MSG_SIZE: usize = 4 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document. Missing sections fall back to defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.client.validate()
    }
}

/// What happens to a new stream when a connection is at its stream limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamOverflow {
    /// Wait in a bounded FIFO queue until a slot frees.
    Queue { depth: usize },
    /// Fail immediately with `CapacityExceeded`.
    Reject,
}

impl Default for StreamOverflow {
    fn default() -> Self {
        StreamOverflow::Queue { depth: 1024 }
    }
}

/// Liveness probing parameters (sender side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Idle period after which a ping is sent.
    #[serde(with = "humantime_serde")]
    pub time: Duration,

    /// How long to wait for the ping acknowledgement.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Keep probing while no streams are open.
    pub permit_without_stream: bool,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            permit_without_stream: true,
        }
    }
}

/// Ping enforcement applied to pings received from the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementPolicy {
    /// Minimum interval between two pings from the peer.
    #[serde(with = "humantime_serde")]
    pub min_ping_interval: Duration,

    /// Accept pings while no streams are open.
    pub permit_without_stream: bool,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            min_ping_interval: Duration::from_secs(5),
            permit_without_stream: true,
        }
    }
}

/// Unary retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    pub backoff_multiplier: f64,

    /// Status codes that trigger another attempt.
    pub retryable_codes: Vec<Code>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retryable_codes: vec![Code::Unavailable],
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("retry max_attempts must be at least 1"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation(
                "retry backoff_multiplier must be >= 1.0",
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(Error::validation(
                "retry initial_backoff must not exceed max_backoff",
            ));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (TCP).
    pub listen_addr: String,

    /// Maximum concurrent TCP connections. Extra connections are dropped.
    pub max_connections: usize,

    /// Maximum concurrent logical streams per connection.
    pub max_concurrent_streams: usize,

    /// Behaviour when `max_concurrent_streams` is reached.
    pub stream_overflow: StreamOverflow,

    /// Width of the unary handler worker pool. `0` means available parallelism.
    pub workers: usize,

    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,

    /// Server-initiated liveness probing.
    pub keepalive: KeepaliveConfig,

    /// Policy applied to client pings.
    pub enforcement: EnforcementPolicy,

    /// Close connections that have had no open stream for this long.
    #[serde(with = "humantime_serde")]
    pub max_connection_idle: Duration,

    /// Ask clients to move off a connection after this age.
    #[serde(with = "humantime_serde")]
    pub max_connection_age: Duration,

    /// Grace period for open streams after `max_connection_age`.
    #[serde(with = "humantime_serde")]
    pub max_connection_age_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:50051".to_string(),
            max_connections: 1000,
            max_concurrent_streams: 1000,
            stream_overflow: StreamOverflow::default(),
            workers: 0,
            max_recv_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_send_msg_size: DEFAULT_MAX_MSG_SIZE,
            keepalive: KeepaliveConfig::default(),
            enforcement: EnforcementPolicy::default(),
            max_connection_idle: Duration::from_secs(30),
            max_connection_age: Duration::from_secs(300),
            max_connection_age_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Effective worker pool width.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_streams == 0 {
            return Err(Error::validation("max_concurrent_streams must be positive"));
        }
        if self.max_connections == 0 {
            return Err(Error::validation("max_connections must be positive"));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target address (`host:port`).
    pub address: String,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    pub keepalive: KeepaliveConfig,

    /// Stream limit applied locally to the client's connection.
    pub max_concurrent_streams: usize,

    pub stream_overflow: StreamOverflow,

    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,

    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:50051".to_string(),
            connect_timeout: Duration::from_secs(20),
            keepalive: KeepaliveConfig::default(),
            max_concurrent_streams: 1000,
            stream_overflow: StreamOverflow::default(),
            max_recv_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_send_msg_size: DEFAULT_MAX_MSG_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_streams == 0 {
            return Err(Error::validation("max_concurrent_streams must be positive"));
        }
        self.retry.validate()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let config = Config::default();
        assert_eq!(config.server.max_concurrent_streams, 1000);
        assert_eq!(config.server.max_recv_msg_size, 4 * 1024 * 1024);
        assert_eq!(config.server.keepalive.time, Duration::from_secs(10));
        assert_eq!(config.server.keepalive.timeout, Duration::from_secs(3));
        assert_eq!(
            config.server.enforcement.min_ping_interval,
            Duration::from_secs(5)
        );
        assert_eq!(config.client.retry.max_attempts, 3);
        assert_eq!(config.client.retry.retryable_codes, vec![Code::Unavailable]);
        assert!(config.server.worker_count() >= 1);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(
            r#"{
                "server": {
                    "max_concurrent_streams": 2,
                    "stream_overflow": { "mode": "reject" },
                    "keepalive": { "time": "1s", "timeout": "500ms", "permit_without_stream": false }
                },
                "client": {
                    "retry": {
                        "max_attempts": 5,
                        "initial_backoff": "50ms",
                        "max_backoff": "2s",
                        "backoff_multiplier": 1.5,
                        "retryable_codes": ["UNAVAILABLE", "RESOURCE_EXHAUSTED"]
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.server.max_concurrent_streams, 2);
        assert_eq!(config.server.stream_overflow, StreamOverflow::Reject);
        assert_eq!(config.server.keepalive.timeout, Duration::from_millis(500));
        assert_eq!(config.server.max_connection_idle, Duration::from_secs(30));
        assert_eq!(config.client.retry.max_attempts, 5);
        assert_eq!(
            config.client.retry.retryable_codes,
            vec![Code::Unavailable, Code::ResourceExhausted]
        );
    }

    #[test]
    fn test_invalid_retry_rejected() {
        let err = Config::from_json_str(
            r#"{"client": {"retry": {
                "max_attempts": 0, "initial_backoff": "1s", "max_backoff": "1s",
                "backoff_multiplier": 2.0, "retryable_codes": []
            }}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"listen_addr": "127.0.0.1:6000"}}}}"#).unwrap();
        let config = Config::from_json_file(file.path()).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:6000");
    }
}
