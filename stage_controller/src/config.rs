use std::net::SocketAddr;
use std::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::autofocus::AfParams;
use crate::motion::{MotionLimits, MotionProfile, WaitTimeModel};
use crate::sequencer::{AcquisitionParams, MicroscopeMode};
use crate::trigger::TriggerMode;
use crate::units::StageGeometry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration file: {source}")]
    ReadError { source: std::io::Error },

    #[error("Failed to parse configuration: {source}")]
    ParseError { source: toml::de::Error },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError { source: toml::ser::Error },

    #[error("Failed to write configuration file: {source}")]
    WriteError { source: std::io::Error },

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

/// Endpoint and timeouts of the MCU's serial-over-TCP bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub address: SocketAddr,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_read_failures: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4001".parse().expect("valid default address"),
            connect_timeout_ms: 2000,
            read_timeout_ms: 300,
            write_timeout_ms: 1000,
            max_read_failures: 8,
        }
    }
}

/// Whole-application configuration, loaded once at startup and
/// immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub trigger_mode: TriggerMode,
    pub microscope_mode: MicroscopeMode,
    pub z_center_mm: f64,
    pub link: LinkConfig,
    pub geometry: StageGeometry,
    pub limits: MotionLimits,
    pub profile: MotionProfile,
    pub wait_time: WaitTimeModel,
    pub autofocus: AfParams,
    pub acquisition: AcquisitionParams,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub motion_ms: u64,
    pub frame_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            motion_ms: 10_000,
            frame_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn motion(&self) -> Duration {
        Duration::from_millis(self.motion_ms)
    }

    pub fn frame(&self) -> Duration {
        Duration::from_millis(self.frame_ms)
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profile.velocity > self.limits.velocity_max {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "default profile velocity {} exceeds the limit {}",
                    self.profile.velocity, self.limits.velocity_max
                ),
            });
        }
        if self.autofocus.z_steps == 0 {
            return Err(ConfigError::ValidationError {
                message: "autofocus z_steps must be at least 1".into(),
            });
        }
        if self.acquisition.cols == 0 || self.acquisition.rows == 0 {
            return Err(ConfigError::ValidationError {
                message: "acquisition grid must have at least one field".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ConfigOptions {
    pub config_path: PathBuf,
    pub create_if_missing: bool,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            create_if_missing: true,
        }
    }
}

impl ConfigOptions {
    pub fn default_config_path() -> PathBuf {
        std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("stage_config.toml"))
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigManager {
    options: ConfigOptions,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            options: ConfigOptions::default(),
        }
    }

    pub fn with_options(options: ConfigOptions) -> Self {
        Self { options }
    }

    pub fn load(&self) -> anyhow::Result<StageConfig> {
        let config_path = self.options.config_path.clone();

        if !config_path.exists() {
            if self.options.create_if_missing {
                let default_config = StageConfig::default();
                self.save(&default_config)
                    .context("Failed to save default config")?;
                return Ok(default_config);
            } else {
                return Err(ConfigError::FileNotFound { path: config_path }.into());
            }
        }

        let content =
            fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError { source: e })?;

        let config: StageConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { source: e })?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, config: &StageConfig) -> anyhow::Result<()> {
        let config_path = &self.options.config_path;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
        }

        let content = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        fs::write(config_path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

pub fn init_config_with_options(
    options: ConfigOptions,
) -> anyhow::Result<(ConfigManager, StageConfig)> {
    let manager = ConfigManager::with_options(options);
    let config = manager.load()?;
    Ok((manager, config))
}

pub fn load_config() -> anyhow::Result<StageConfig> {
    let (_manager, config) = init_config_with_options(ConfigOptions::default())?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage_config.toml");

        let manager = ConfigManager::with_options(ConfigOptions::with_path(&path));
        let saved = StageConfig::default();
        manager.save(&saved).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded.geometry.steps_per_mm_z, saved.geometry.steps_per_mm_z);
        assert_eq!(loaded.limits.velocity_max, saved.limits.velocity_max);
        assert_eq!(loaded.autofocus.stop_threshold, saved.autofocus.stop_threshold);
        assert_eq!(loaded.acquisition.crop_width, saved.acquisition.crop_width);
        assert_eq!(loaded.trigger_mode, saved.trigger_mode);
        assert_eq!(loaded.link.address, saved.link.address);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stage_config.toml");

        let manager = ConfigManager::with_options(ConfigOptions::with_path(&path));
        let config = manager.load().unwrap();

        assert!(path.exists());
        assert_eq!(config.timeouts.motion_ms, 10_000);
    }

    #[test]
    fn missing_file_without_create_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = ConfigOptions {
            config_path: dir.path().join("absent.toml"),
            create_if_missing: false,
        };

        let err = ConfigManager::with_options(options).load().unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn invalid_profile_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage_config.toml");

        let mut config = StageConfig::default();
        config.profile.velocity = config.limits.velocity_max + 1.0;

        let manager = ConfigManager::with_options(ConfigOptions::with_path(&path));
        manager.save(&config).unwrap();
        assert!(manager.load().is_err());
    }
}
