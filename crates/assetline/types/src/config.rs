//! Container configuration.
//!
//! Every section has sensible defaults, so an empty or missing file yields a
//! working configuration:
//!
//! ```toml
//! [history]
//! max_size = 100
//!
//! [validity]
//! tolerance_ms = 1000
//!
//! [race]
//! default_timeout_ms = 30000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for all container primitives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Temporal status history settings.
    pub history: HistoryConfig,

    /// Interval-conflict store settings.
    pub validity: ValidityConfig,

    /// Priority race executor settings.
    pub race: RaceConfig,
}

impl ContainerConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ContainerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no container can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.max_size == 0 {
            return Err(ConfigError::Invalid(
                "history.max_size must be at least 1".into(),
            ));
        }
        if self.race.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "race.default_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Temporal status history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of retained entries; the newest are kept.
    pub max_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_size: 100 }
    }
}

/// Interval-conflict store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidityConfig {
    /// Default tolerance, in milliseconds, when comparing window bounds.
    pub tolerance_ms: u64,
}

impl ValidityConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }
}

impl Default for ValidityConfig {
    fn default() -> Self {
        Self { tolerance_ms: 1000 }
    }
}

/// Priority race executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Timeout, in milliseconds, for races started without an explicit one.
    pub default_timeout_ms: u64,
}

impl RaceConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}
