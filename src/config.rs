use crate::defaults;
use crate::error::{Result, VoxliveError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

/// Connection and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

/// Microphone capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub frame_samples: usize,
    pub turn_complete_grace_ms: u64,
}

/// Speaker playback configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub container_fallback: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::ENDPOINT.to_string(),
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            reconnect_attempts: defaults::RECONNECT_ATTEMPTS,
            reconnect_backoff_ms: defaults::RECONNECT_BACKOFF_MS,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            frame_samples: defaults::FRAME_SAMPLES,
            turn_complete_grace_ms: defaults::TURN_COMPLETE_GRACE_MS,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            container_fallback: true,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl CaptureConfig {
    pub fn turn_complete_grace(&self) -> Duration {
        Duration::from_millis(self.turn_complete_grace_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                {
                    Ok(Self::default())
                } else {
                    Err(e.context(format!("Failed to load config from {}", path.display())))
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXLIVE_ENDPOINT → session.endpoint
    /// - VOXLIVE_AUDIO_DEVICE → capture.device
    /// - VOXLIVE_OUTPUT_DEVICE → playback.device
    /// - VOXLIVE_TURN_GRACE_MS → capture.turn_complete_grace_ms
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("VOXLIVE_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.session.endpoint = endpoint;
        }

        if let Ok(device) = std::env::var("VOXLIVE_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.capture.device = Some(device);
        }

        if let Ok(device) = std::env::var("VOXLIVE_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.playback.device = Some(device);
        }

        if let Ok(grace) = std::env::var("VOXLIVE_TURN_GRACE_MS")
            && let Ok(ms) = grace.trim().parse::<u64>()
        {
            self.capture.turn_complete_grace_ms = ms;
        }

        self
    }

    /// Check values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<()> {
        let endpoint = &self.session.endpoint;
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "session.endpoint".to_string(),
                message: format!("'{}' must start with ws:// or wss://", endpoint),
            });
        }

        if self.session.connect_timeout_ms == 0 {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "session.connect_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.capture.frame_samples == 0 {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "capture.frame_samples".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.capture.turn_complete_grace_ms > defaults::MAX_TURN_COMPLETE_GRACE_MS {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "capture.turn_complete_grace_ms".to_string(),
                message: format!(
                    "{}ms exceeds the {}ms maximum",
                    self.capture.turn_complete_grace_ms,
                    defaults::MAX_TURN_COMPLETE_GRACE_MS
                ),
            });
        }

        Ok(())
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VoxliveError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Write the default configuration to `path`, creating parent directories.
    ///
    /// Refuses to overwrite an existing file unless `force` is set.
    pub fn write_default(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(VoxliveError::Other(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, Self::default().to_toml()?)?;
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxlive/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxlive")
            .join("config.toml")
    }
}
