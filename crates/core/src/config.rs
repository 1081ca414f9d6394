//! Process-level command configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding [`CommandConfig::channel_capacity`].
pub const ENV_CHANNEL_CAPACITY: &str = "REFLEX_CHANNEL_CAPACITY";
/// Environment variable overriding [`CommandConfig::status_enabled`].
pub const ENV_STATUS_ENABLED: &str = "REFLEX_STATUS_ENABLED";

/// Settings shared by every command built from one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandConfig {
    /// Undelivered events a subscriber of a command's channel may hold before
    /// it is logged as falling behind. Delivery itself is never lossy.
    pub channel_capacity: usize,

    /// When `false`, no invocation is reported to the status sink.
    pub status_enabled: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            status_enabled: true,
        }
    }
}

impl CommandConfig {
    /// Zero is raised to 1.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_status_enabled(mut self, enabled: bool) -> Self {
        self.status_enabled = enabled;
        self
    }

    /// Defaults overridden by `REFLEX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_CHANNEL_CAPACITY) {
            config.channel_capacity = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_value(ENV_CHANNEL_CAPACITY, raw.clone()))?;
        }

        if let Some(raw) = lookup(ENV_STATUS_ENABLED) {
            config.status_enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(ConfigError::invalid_value(ENV_STATUS_ENABLED, raw)),
            };
        }

        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::invalid_value("channelCapacity", "0"));
        }
        Ok(self)
    }
}
