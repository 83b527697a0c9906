//! Session configuration loaded from TOML
//!
//! Every section and field is optional; anything missing takes its default.
//!
//! ```toml
//! [lifecycle]
//! join_timeout = 15000
//! reconnect_attempts = 5
//!
//! [limits]
//! max_damage_per_hit = 9999.0
//!
//! [sync]
//! scene_allow_list = ["town", "dungeon"]
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::LifecycleConfig;
use crate::sync::{SyncConfig, ValidationLimits};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// All tunables of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub lifecycle: LifecycleConfig,
    pub limits: ValidationLimits,
    pub sync: SyncConfig,
}

impl TandemConfig {
    /// Load from a TOML file and normalize
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config.validated())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn validated(self) -> Self {
        Self {
            lifecycle: self.lifecycle.validated(),
            limits: self.limits.validated(),
            sync: self.sync.validated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = TandemConfig::from_toml("").unwrap();
        assert_eq!(config, TandemConfig::default().validated());
        assert_eq!(config.lifecycle.join_timeout, Duration::from_secs(15));
        assert_eq!(config.limits.max_messages_per_second, 100);
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
            [lifecycle]
            reconnect_attempts = 3

            [sync]
            scene_allow_list = ["town"]
        "#;
        let config = TandemConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.lifecycle.reconnect_attempts, 3);
        assert_eq!(config.lifecycle.reconnect_delay, Duration::from_secs(2));
        assert!(config.sync.scene_allowed("town"));
        assert!(!config.sync.scene_allowed("dungeon"));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("tandem-{}.toml", uuid::Uuid::new_v4()));
        let mut config = TandemConfig::default();
        config.limits.max_damage_per_hit = 500.0;
        config.save(&path).unwrap();

        let loaded = TandemConfig::load(&path).unwrap();
        assert_eq!(loaded.limits.max_damage_per_hit, 500.0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            TandemConfig::from_toml("lifecycle = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
