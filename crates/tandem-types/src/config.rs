//! Multi-device configuration with sensible defaults.
//!
//! All operational parameters of the linking core are centralized
//! here. Every value has a documented default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TandemError};

/// Default resolution cache staleness window.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 20;

/// Default lifetime of an open linking session.
pub const DEFAULT_LINKING_TIMEOUT_SECS: u64 = 120;

/// Default body of auto-generated friend requests.
pub const DEFAULT_FRIEND_REQUEST_TEXT: &str =
    "Please accept to enable messages to be synced across devices";

/// Configuration for the multi-device core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiDeviceConfig {
    /// Seconds after which a resolution cache entry is stale and the
    /// next resolution refreshes it from the directory.
    pub refresh_interval_secs: u64,

    /// Seconds an open linking session may wait for its peer before
    /// it is cancelled.
    pub linking_timeout_secs: u64,

    /// Body of the friend request substituted for content sent to an
    /// untrusted device.
    pub friend_request_text: String,

    /// Capacity of the bounded diagnostic event channel.
    pub event_channel_size: usize,
}

impl Default for MultiDeviceConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            linking_timeout_secs: DEFAULT_LINKING_TIMEOUT_SECS,
            friend_request_text: DEFAULT_FRIEND_REQUEST_TEXT.to_string(),
            event_channel_size: 256,
        }
    }
}

impl MultiDeviceConfig {
    /// Loads a configuration from a JSON file. Missing fields take
    /// their default values. The result is validated.
    ///
    /// # Errors
    ///
    /// - `ConfigError` if the file cannot be read, is not valid JSON,
    ///   or fails [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TandemError::ConfigError {
            reason: format!("failed to read config {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| TandemError::ConfigError {
            reason: format!("invalid config JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_secs == 0 {
            return Err(TandemError::ConfigError {
                reason: "refresh_interval_secs must be greater than 0".into(),
            });
        }

        if self.linking_timeout_secs == 0 {
            return Err(TandemError::ConfigError {
                reason: "linking_timeout_secs must be greater than 0".into(),
            });
        }

        if self.friend_request_text.trim().is_empty() {
            return Err(TandemError::ConfigError {
                reason: "friend_request_text must not be empty".into(),
            });
        }

        if self.event_channel_size == 0 {
            return Err(TandemError::ConfigError {
                reason: "event_channel_size must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Refresh interval as a [`Duration`].
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Linking timeout as a [`Duration`].
    pub fn linking_timeout(&self) -> Duration {
        Duration::from_secs(self.linking_timeout_secs)
    }
}
