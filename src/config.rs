//! Tracker client configuration
//!
//! Protocol timing and socket settings, loadable from a JSON file. Every
//! field has a default, so a partial file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TorrentError};
use crate::tracker::backoff::{RetryPolicy, DEFAULT_MAX_RETRIES};

/// One byte more than any UDP payload, so a full read means the datagram
/// did not fit
pub const MAX_RECV_BUFFER: usize = 65_536;

/// Settings for UDP tracker sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Timeout of the first attempt, doubled on every retry
    pub initial_timeout_secs: u64,
    /// Retransmissions after the first attempt
    pub max_retries: u32,
    /// How long a connection id stays usable
    pub connection_ttl_secs: u64,
    /// Receive buffer per datagram. A datagram that fills it is treated as
    /// truncated.
    pub recv_buffer_size: usize,
    /// Local address the socket binds to
    pub bind_addr: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            initial_timeout_secs: 15,
            max_retries: DEFAULT_MAX_RETRIES,
            connection_ttl_secs: 60,
            recv_buffer_size: MAX_RECV_BUFFER,
            bind_addr: "0.0.0.0:0".to_string(),
        }
    }
}

impl TrackerConfig {
    /// Load from a JSON file and validate
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        debug!("Loaded tracker config from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| TorrentError::config_error(format!("invalid config json: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_timeout_secs == 0 {
            return Err(TorrentError::config_error_with_field(
                "initial timeout must be at least 1 second",
                "initial_timeout_secs",
            ));
        }
        if self.max_retries > 16 {
            return Err(TorrentError::config_error_with_field(
                format!("max_retries {} is above 16", self.max_retries),
                "max_retries",
            ));
        }
        if self.connection_ttl_secs == 0 {
            return Err(TorrentError::config_error_with_field(
                "connection ttl must be at least 1 second",
                "connection_ttl_secs",
            ));
        }
        if self.recv_buffer_size < 20 || self.recv_buffer_size > MAX_RECV_BUFFER {
            return Err(TorrentError::config_error_with_field(
                format!(
                    "recv_buffer_size {} not in 20..={}",
                    self.recv_buffer_size, MAX_RECV_BUFFER
                ),
                "recv_buffer_size",
            ));
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(TorrentError::config_error_with_field(
                format!("bind_addr '{}' is not a socket address", self.bind_addr),
                "bind_addr",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.initial_timeout_secs), self.max_retries)
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_ttl_secs)
    }
}
