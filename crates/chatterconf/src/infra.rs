//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations for clips and persisted settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding playable clips.
    /// Default: ~/sounds
    #[serde(default = "PathsConfig::default_sound_dir")]
    pub sound_dir: PathBuf,

    /// JSON settings document (runtime source of truth).
    /// Default: ~/.config/chatterbox/settings.json
    #[serde(default = "PathsConfig::default_settings_file")]
    pub settings_file: PathBuf,
}

impl PathsConfig {
    fn default_sound_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("sounds"))
            .unwrap_or_else(|| PathBuf::from("sounds"))
    }

    fn default_settings_file() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("chatterbox/settings.json"))
            .unwrap_or_else(|| PathBuf::from("settings.json"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sound_dir: Self::default_sound_dir(),
            settings_file: Self::default_settings_file(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Servo/GPIO daemon connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// pigpiod socket address.
    /// Default: 127.0.0.1:8888
    #[serde(default = "ActuatorConfig::default_pigpiod_addr")]
    pub pigpiod_addr: String,

    /// Connect timeout in milliseconds.
    /// Default: 500
    #[serde(default = "ActuatorConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ActuatorConfig {
    fn default_pigpiod_addr() -> String {
        "127.0.0.1:8888".to_string()
    }

    fn default_connect_timeout_ms() -> u64 {
        500
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            pigpiod_addr: Self::default_pigpiod_addr(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
        }
    }
}

/// External effects processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectsConfig {
    /// SoX executable, looked up on PATH unless absolute.
    /// Default: sox
    #[serde(default = "EffectsConfig::default_sox_program")]
    pub sox_program: PathBuf,
}

impl EffectsConfig {
    fn default_sox_program() -> PathBuf {
        PathBuf::from("sox")
    }
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            sox_program: Self::default_sox_program(),
        }
    }
}

/// All infrastructure configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub actuator: ActuatorConfig,

    #[serde(default)]
    pub effects: EffectsConfig,
}
