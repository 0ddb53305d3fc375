//! Dispatcher and shared networking configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Model selected when no `/use` command has been issued yet
pub const DEFAULT_MODEL: &str = "bing";

/// Upper bound on how long one routed call may hold the dispatcher turn
pub const DEFAULT_TURN_TIMEOUT_SECS: u64 = 180;

/// Delay between bootstrap attempts after a transient failure
pub const DEFAULT_BOOTSTRAP_BACKOFF_MS: u64 = 1500;

/// WebSocket handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Dispatcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Model used until a `/use` command switches it
    pub default_model: Option<String>,
    /// Safety limit for one call holding the turn; `0` disables the limit
    pub turn_timeout_secs: Option<u64>,
    /// Backoff between bootstrap retries in milliseconds
    pub bootstrap_backoff_ms: Option<u64>,
    /// Cap on bootstrap attempts; unset means retry until success
    pub bootstrap_max_attempts: Option<u32>,
    /// Socket connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
    /// HTTP(S) proxy applied to every backend (`HTTP_PROXY`)
    pub proxy: Option<String>,
}

impl DispatcherConfig {
    /// Get the default model name
    pub fn default_model(&self) -> String {
        self.default_model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Get the turn safety limit, `None` when disabled
    pub fn turn_timeout(&self) -> Option<Duration> {
        match self.turn_timeout_secs.unwrap_or(DEFAULT_TURN_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get the bootstrap backoff
    pub fn bootstrap_backoff(&self) -> Duration {
        Duration::from_millis(
            self.bootstrap_backoff_ms
                .unwrap_or(DEFAULT_BOOTSTRAP_BACKOFF_MS),
        )
    }

    /// Get the socket connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }
}
