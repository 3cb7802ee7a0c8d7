//! Controller configuration.
//!
//! All tunables are carried in an explicit [`ControllerConfig`] value
//! handed to the controller at spawn time; there is no process-global
//! state.

use std::time::Duration;

use crate::reader::RemoteSettings;

/// Delay before the first connection attempt after a connect request.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Delay between retries after a failed attempt or lost link.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Timeout handed to the vendor port when opening a reader.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Configuration for a [`crate::ConnectionController`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerConfig {
    /// Bluetooth MAC address of the target reader.
    pub address: String,
    /// Timeout for the vendor open call.
    pub open_timeout: Duration,
    /// Delay before the first connection attempt.
    pub initial_delay: Duration,
    /// Delay between retries while auto-reconnect holds.
    pub retry_delay: Duration,
    /// Whether failed attempts and lost links are retried automatically.
    pub auto_reconnect: bool,
    /// Settings pushed to the remote device right after connecting.
    pub remote_settings: RemoteSettings,
}

impl ControllerConfig {
    /// Create a configuration targeting the given reader address with
    /// default timing.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            initial_delay: DEFAULT_INITIAL_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
            auto_reconnect: true,
            remote_settings: RemoteSettings::default(),
        }
    }

    /// Set the vendor open timeout.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the delay before the first connection attempt.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay between retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set whether auto-reconnect starts out enabled.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the remote device settings applied after connecting.
    pub fn with_remote_settings(mut self, settings: RemoteSettings) -> Self {
        self.remote_settings = settings;
        self
    }
}
