use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{rate::DEFAULT_BATCH_SIZE, LoggerError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sensor: SensorConfig,
    pub log: LogConfig,
    pub catalog: CatalogConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensor.rate_batch_size == 0 {
            return Err(LoggerError::Config(
                "sensor.rate_batch_size must be at least 1".into(),
            ));
        }
        if self.log.device_identity.trim().is_empty() {
            return Err(LoggerError::Config("log.device_identity is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Arrivals per sampling-rate estimate.
    pub rate_batch_size: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            rate_batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Where and how test logs are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub output_dir: PathBuf,
    pub device_identity: String,
    /// Sync file data every N appends; 0 disables explicit syncing.
    pub sync_interval: u32,
    /// Consecutive append failures before the operator is alerted.
    pub failure_threshold: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            device_identity: "Unknown_Device".to_string(),
            sync_interval: 0,
            failure_threshold: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub root: PathBuf,
    /// Group directories under `root`, concatenated in this order.
    pub groups: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tracks"),
            groups: vec!["train".to_string(), "test".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "log": { "device_identity": "Pixel_7" } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.log.device_identity, "Pixel_7");
        assert_eq!(config.log.failure_threshold, 25);
        assert_eq!(config.sensor.rate_batch_size, 25);
        assert_eq!(config.catalog.groups, ["train", "test"]);
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = AppConfig::default();
        config.sensor.rate_batch_size = 0;
        assert!(matches!(config.validate(), Err(LoggerError::Config(_))));
    }
}
