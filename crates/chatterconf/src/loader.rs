//! Config file discovery, loading, and environment variable overlay.

use crate::infra::{ActuatorConfig, EffectsConfig, PathsConfig, TelemetryConfig};
use crate::{ChatterConfig, ConfigError, InfraConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/chatterbox/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("chatterbox/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("chatterbox.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<ChatterConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from TOML string.
///
/// Absent keys keep their defaults so that `merge_configs` can tell which
/// values a file actually set.
pub(crate) fn parse_toml(contents: &str, path: &Path) -> Result<ChatterConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut infra = InfraConfig::default();

    if let Some(paths) = table.get("paths").and_then(|v| v.as_table()) {
        if let Some(v) = paths.get("sound_dir").and_then(|v| v.as_str()) {
            infra.paths.sound_dir = expand_path(v);
        }
        if let Some(v) = paths.get("settings_file").and_then(|v| v.as_str()) {
            infra.paths.settings_file = expand_path(v);
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            infra.telemetry.log_level = v.to_string();
        }
    }

    if let Some(actuator) = table.get("actuator").and_then(|v| v.as_table()) {
        if let Some(v) = actuator.get("pigpiod_addr").and_then(|v| v.as_str()) {
            infra.actuator.pigpiod_addr = v.to_string();
        }
        if let Some(v) = actuator.get("connect_timeout_ms").and_then(|v| v.as_integer()) {
            if v < 0 {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: format!("actuator.connect_timeout_ms must be positive, got {v}"),
                });
            }
            infra.actuator.connect_timeout_ms = v as u64;
        }
    }

    if let Some(effects) = table.get("effects").and_then(|v| v.as_table()) {
        if let Some(v) = effects.get("sox_program").and_then(|v| v.as_str()) {
            infra.effects.sox_program = expand_path(v);
        }
    }

    Ok(ChatterConfig { infra })
}

/// Take `overlay` unless it still holds the compiled default.
fn pick<T: PartialEq>(overlay: T, base: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence field by field.
pub fn merge_configs(base: ChatterConfig, overlay: ChatterConfig) -> ChatterConfig {
    let paths = PathsConfig::default();
    let telemetry = TelemetryConfig::default();
    let actuator = ActuatorConfig::default();
    let effects = EffectsConfig::default();

    let (b, o) = (base.infra, overlay.infra);
    ChatterConfig {
        infra: InfraConfig {
            paths: PathsConfig {
                sound_dir: pick(o.paths.sound_dir, b.paths.sound_dir, paths.sound_dir),
                settings_file: pick(
                    o.paths.settings_file,
                    b.paths.settings_file,
                    paths.settings_file,
                ),
            },
            telemetry: TelemetryConfig {
                log_level: pick(
                    o.telemetry.log_level,
                    b.telemetry.log_level,
                    telemetry.log_level,
                ),
            },
            actuator: ActuatorConfig {
                pigpiod_addr: pick(
                    o.actuator.pigpiod_addr,
                    b.actuator.pigpiod_addr,
                    actuator.pigpiod_addr,
                ),
                connect_timeout_ms: pick(
                    o.actuator.connect_timeout_ms,
                    b.actuator.connect_timeout_ms,
                    actuator.connect_timeout_ms,
                ),
            },
            effects: EffectsConfig {
                sox_program: pick(
                    o.effects.sox_program,
                    b.effects.sox_program,
                    effects.sox_program,
                ),
            },
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ChatterConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("CHATTERBOX_SOUND_DIR") {
        config.infra.paths.sound_dir = expand_path(&v);
        sources.env_overrides.push("CHATTERBOX_SOUND_DIR".to_string());
    }
    if let Ok(v) = env::var("CHATTERBOX_SETTINGS_FILE") {
        config.infra.paths.settings_file = expand_path(&v);
        sources.env_overrides.push("CHATTERBOX_SETTINGS_FILE".to_string());
    }

    if let Ok(v) = env::var("CHATTERBOX_PIGPIOD_ADDR") {
        config.infra.actuator.pigpiod_addr = v;
        sources.env_overrides.push("CHATTERBOX_PIGPIOD_ADDR".to_string());
    }
    if let Ok(v) = env::var("CHATTERBOX_SOX_PROGRAM") {
        config.infra.effects.sox_program = expand_path(&v);
        sources.env_overrides.push("CHATTERBOX_SOX_PROGRAM".to_string());
    }

    if let Ok(v) = env::var("CHATTERBOX_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("CHATTERBOX_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        directories::BaseDirs::new()
            .map(|d| d.home_dir().join(stripped))
            .unwrap_or_else(|| PathBuf::from(path))
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            match env::var(var_name) {
                Ok(var_value) => PathBuf::from(var_value).join(&stripped[slash_pos + 1..]),
                Err(_) => PathBuf::from(path),
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
