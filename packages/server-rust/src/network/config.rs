//! Server and per-session configuration.
//!
//! Defaults follow the classic game-gateway profile: big-endian headers,
//! 8 KiB frame limits, 10-slot queues, 60 s timeouts and 3 idle retries.
//! Configuration files are JSON with durations in milliseconds; any field
//! left out keeps its default.

use std::path::Path;
use std::time::Duration;

use framewire_core::{ByteOrder, FrameCodec, MAX_FRAME_LEN};
use serde::Deserialize;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Transport family: `tcp`, `tcp4` or `tcp6`.
    pub network: String,
    /// Bind address for the listener.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Byte order of the frame length header and message id.
    pub byte_order: ByteOrder,
    /// Largest outbound frame payload in bytes.
    pub max_send_buffer_size: usize,
    /// Largest inbound frame payload in bytes.
    pub max_recv_buffer_size: usize,
    /// When set, every accepted session is heartbeated at this interval
    /// (requires a registered heartbeat route).
    pub heartbeat_interval: Option<Duration>,
    /// Upper bound on waiting for in-flight handlers during `stop()`.
    pub drain_timeout: Duration,
    /// Per-session settings.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            host: "0.0.0.0".to_string(),
            port: 10001,
            byte_order: ByteOrder::BigEndian,
            max_send_buffer_size: 8 * 1024,
            max_recv_buffer_size: 8 * 1024,
            heartbeat_interval: None,
            drain_timeout: Duration::from_secs(30),
            session: SessionConfig::default(),
        }
    }
}

/// Per-session queue sizes and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Capacity of the outbound queue; a full queue makes `send` fail fast.
    pub send_queue_size: usize,
    /// Capacity of the inbound queue between the recv and dispatch loops.
    pub recv_queue_size: usize,
    /// Maximum time a single frame write may take before the session closes.
    pub send_timeout: Duration,
    /// Length of one idle period on the dispatch loop.
    pub read_timeout: Duration,
    /// Consecutive idle periods tolerated before the session closes.
    pub read_timeout_times: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_queue_size: 10,
            recv_queue_size: 10,
            send_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(60),
            read_timeout_times: 3,
        }
    }
}

impl ServerConfig {
    /// `host:port` string handed to the listener.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Frame codec matching this configuration.
    #[must_use]
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(
            self.byte_order,
            self.max_recv_buffer_size,
            self.max_send_buffer_size,
        )
    }

    /// Checks the configuration for values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.network.as_str(), "tcp" | "tcp4" | "tcp6") {
            return Err(invalid(format!("unsupported network {:?}", self.network)));
        }
        for (name, size) in [
            ("max_send_buffer_size", self.max_send_buffer_size),
            ("max_recv_buffer_size", self.max_recv_buffer_size),
        ] {
            if size == 0 || size > MAX_FRAME_LEN {
                return Err(invalid(format!("{name} must be within 1..={MAX_FRAME_LEN}")));
            }
        }
        if self.heartbeat_interval == Some(Duration::ZERO) {
            return Err(invalid("heartbeat_interval must be non-zero"));
        }
        self.session.validate()
    }

    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// `Parse` on malformed JSON or unknown fields, `Invalid` if the result
    /// fails [`ServerConfig::validate`].
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: ServerConfigFile = serde_json::from_str(json)?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, otherwise as [`ServerConfig::from_json`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl SessionConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for zero queue sizes or timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_size == 0 || self.recv_queue_size == 0 {
            return Err(invalid("queue sizes must be non-zero"));
        }
        if self.send_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(invalid("timeouts must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}

// ---------------------------------------------------------------------------
// File form
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerConfigFile {
    network: String,
    host: String,
    port: u16,
    byte_order: ByteOrder,
    max_send_buffer_size: usize,
    max_recv_buffer_size: usize,
    heartbeat_interval_ms: Option<u64>,
    drain_timeout_ms: u64,
    session: SessionConfigFile,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SessionConfigFile {
    send_queue_size: usize,
    recv_queue_size: usize,
    send_timeout_ms: u64,
    read_timeout_ms: u64,
    read_timeout_times: u32,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        let d = ServerConfig::default();
        Self {
            network: d.network,
            host: d.host,
            port: d.port,
            byte_order: d.byte_order,
            max_send_buffer_size: d.max_send_buffer_size,
            max_recv_buffer_size: d.max_recv_buffer_size,
            heartbeat_interval_ms: d.heartbeat_interval.map(millis),
            drain_timeout_ms: millis(d.drain_timeout),
            session: SessionConfigFile::default(),
        }
    }
}

impl Default for SessionConfigFile {
    fn default() -> Self {
        let d = SessionConfig::default();
        Self {
            send_queue_size: d.send_queue_size,
            recv_queue_size: d.recv_queue_size,
            send_timeout_ms: millis(d.send_timeout),
            read_timeout_ms: millis(d.read_timeout),
            read_timeout_times: d.read_timeout_times,
        }
    }
}

impl From<ServerConfigFile> for ServerConfig {
    fn from(f: ServerConfigFile) -> Self {
        Self {
            network: f.network,
            host: f.host,
            port: f.port,
            byte_order: f.byte_order,
            max_send_buffer_size: f.max_send_buffer_size,
            max_recv_buffer_size: f.max_recv_buffer_size,
            heartbeat_interval: f.heartbeat_interval_ms.map(Duration::from_millis),
            drain_timeout: Duration::from_millis(f.drain_timeout_ms),
            session: SessionConfig {
                send_queue_size: f.session.send_queue_size,
                recv_queue_size: f.session.recv_queue_size,
                send_timeout: Duration::from_millis(f.session.send_timeout_ms),
                read_timeout: Duration::from_millis(f.session.read_timeout_ms),
                read_timeout_times: f.session.read_timeout_times,
            },
        }
    }
}
