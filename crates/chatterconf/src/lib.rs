//! Configuration loading and persisted settings for chatterbox.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change while the
//!   process runs - the clip directory, where settings live, log filter,
//!   the GPIO daemon address, the SoX executable. Loaded from TOML.
//!
//! - **Settings** (`Settings`): the runtime tunables (devices, gains, servo
//!   angles, live session parameters, effect presets). Persisted as a JSON
//!   document through a [`SettingsStore`]; after startup the store is the
//!   source of truth.
//!
//! # Usage
//!
//! ```rust,no_run
//! use chatterconf::{ChatterConfig, JsonFileStore, SettingsStore};
//!
//! let config = ChatterConfig::load().expect("Failed to load config");
//! println!("Clips: {}", config.infra.paths.sound_dir.display());
//!
//! let store = JsonFileStore::new(&config.infra.paths.settings_file);
//! let settings = store.load().expect("Failed to load settings");
//! println!("Servo on GPIO {:?}", settings.servo.gpio);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/chatterbox/config.toml` (system)
//! 2. `~/.config/chatterbox/config.toml` (user)
//! 3. `./chatterbox.toml` (local override, or `--config`)
//! 4. Environment variables (`CHATTERBOX_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! sound_dir = "~/sounds"
//! settings_file = "~/.config/chatterbox/settings.json"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [actuator]
//! pigpiod_addr = "127.0.0.1:8888"
//!
//! [effects]
//! sox_program = "sox"
//! ```

pub mod infra;
pub mod loader;
pub mod settings;
pub mod store;

pub use infra::{ActuatorConfig, EffectsConfig, InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use settings::{
    default_presets, AudioSettings, LiveFxSettings, LiveMode, LiveNormalSettings, LiveSettings,
    PlayPolicy, PlaybackSettings, PresetParams, ServoSettings, Settings, TrackMeta, GPIO_PINS,
    MAX_GAIN_DB, MIN_GAIN_DB,
};
pub use store::{JsonFileStore, MemoryStore, SettingsStore};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Settings document errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write settings {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete chatterbox infrastructure configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatterConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,
}

impl ChatterConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/chatterbox/config.toml`
    /// 3. `~/.config/chatterbox/config.toml`
    /// 4. `./chatterbox.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with a specific file in place of `./chatterbox.toml`.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = ChatterConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand to keep section order and a header comment
        let mut output = String::new();

        output.push_str("# chatterbox configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "sound_dir = \"{}\"\n",
            self.infra.paths.sound_dir.display()
        ));
        output.push_str(&format!(
            "settings_file = \"{}\"\n",
            self.infra.paths.settings_file.display()
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[actuator]\n");
        output.push_str(&format!(
            "pigpiod_addr = \"{}\"\n",
            self.infra.actuator.pigpiod_addr
        ));
        output.push_str(&format!(
            "connect_timeout_ms = {}\n",
            self.infra.actuator.connect_timeout_ms
        ));

        output.push_str("\n[effects]\n");
        output.push_str(&format!(
            "sox_program = \"{}\"\n",
            self.infra.effects.sox_program.display()
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_default_config() {
        let config = ChatterConfig::default();
        assert_eq!(config.infra.actuator.pigpiod_addr, "127.0.0.1:8888");
        assert_eq!(config.infra.effects.sox_program, PathBuf::from("sox"));
    }

    #[test]
    fn test_to_toml_reparses() {
        let mut config = ChatterConfig::default();
        config.infra.paths.sound_dir = PathBuf::from("/srv/sounds");
        config.infra.actuator.connect_timeout_ms = 900;

        let toml = config.to_toml();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[actuator]"));

        let reparsed = loader::parse_toml(&toml, Path::new("rendered.toml")).unwrap();
        assert_eq!(reparsed.infra, config.infra);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatterbox.toml");
        std::fs::write(&path, "[effects]\nsox_program = \"/opt/sox/bin/sox\"\n").unwrap();

        let (config, sources) = ChatterConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        // CHATTERBOX_SOX_PROGRAM would override; only assert when unset
        if std::env::var("CHATTERBOX_SOX_PROGRAM").is_err() {
            assert_eq!(config.infra.effects.sox_program, PathBuf::from("/opt/sox/bin/sox"));
        }
    }
}
