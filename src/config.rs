//! Channel configuration.
//!
//! A `ChannelConfig` is built once per channel instance and handed to
//! `Channel::attach`. The daemon entry point loads overrides from
//! `HOSTLINK_*` environment variables; the channel itself has no
//! command-line surface and persists nothing across restarts.

use std::path::PathBuf;
use std::time::Duration;

/// Default socket path the daemon listens on for the host queue pair.
pub const DEFAULT_QUEUE_SOCKET: &str = "/run/hostlink/queue.sock";

/// Default socket path for the local control endpoint.
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/hostlink/control.sock";

/// Default acknowledgment wait window. A submit that is not acked within
/// this window surfaces a transport error instead of blocking forever.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 30_000;

/// Per-instance channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Where the daemon exposes the command/result queue pair.
    pub queue_socket: PathBuf,
    /// Where the daemon exposes the userspace control endpoint.
    pub control_socket: PathBuf,
    /// Acknowledgment wait window. `None` waits forever; the default is
    /// bounded so a silent host surfaces as an error.
    pub ack_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_socket: PathBuf::from(DEFAULT_QUEUE_SOCKET),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            ack_timeout: Some(Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS)),
        }
    }
}

impl ChannelConfig {
    /// Configuration with environment overrides applied:
    /// `HOSTLINK_QUEUE_SOCKET`, `HOSTLINK_CONTROL_SOCKET`, and
    /// `HOSTLINK_ACK_TIMEOUT_MS` (`0` disables the timeout).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("HOSTLINK_QUEUE_SOCKET") {
            config.queue_socket = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("HOSTLINK_CONTROL_SOCKET") {
            config.control_socket = PathBuf::from(path);
        }
        if let Ok(ms) = std::env::var("HOSTLINK_ACK_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(0) => config.ack_timeout = None,
                Ok(ms) => config.ack_timeout = Some(Duration::from_millis(ms)),
                Err(_) => {
                    tracing::warn!(value = %ms, "invalid HOSTLINK_ACK_TIMEOUT_MS, keeping default");
                }
            }
        }
        config
    }

    /// Set the queue socket path.
    pub fn with_queue_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_socket = path.into();
        self
    }

    /// Set the control socket path.
    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = path.into();
        self
    }

    /// Set or disable the acknowledgment wait window.
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }
}
