//! Device configuration – reads/writes `~/.homewatch/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use homewatch_runtime::telemetry::LogFormat;
use homewatch_types::SensorKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ConfigError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Persisted settings stored in `~/.homewatch/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Redis server holding the series, settings and bus traffic.
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Run on the simulated drivers instead of real hardware.
    #[serde(default = "default_mock_sensors")]
    pub mock_sensors: bool,

    /// Reply window for camera commands.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Sensors whose readings are written to their time series.
    #[serde(default = "default_recorded_series")]
    pub recorded_series: Vec<SensorKind>,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}
fn default_mock_sensors() -> bool {
    true
}
fn default_ack_timeout_ms() -> u64 {
    1000
}
fn default_recorded_series() -> Vec<SensorKind> {
    vec![
        SensorKind::Light,
        SensorKind::Sound,
        SensorKind::Temperature,
        SensorKind::Humidity,
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            mock_sensors: default_mock_sensors(),
            ack_timeout_ms: default_ack_timeout_ms(),
            recorded_series: default_recorded_series(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Return the path to `~/.homewatch/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".homewatch").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `HOMEWATCH_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HOMEWATCH_STORE_URL` | `store_url` |
/// | `HOMEWATCH_MOCK_SENSORS` | `mock_sensors` (`true`/`false`/`1`/`0`) |
/// | `HOMEWATCH_ACK_TIMEOUT_MS` | `ack_timeout_ms` |
///
/// Unparseable values are ignored.  `HOMEWATCH_LOG_FORMAT` is read by the
/// telemetry setup directly.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("HOMEWATCH_STORE_URL")
        && !v.trim().is_empty()
    {
        cfg.store_url = v.trim().to_string();
    }
    if let Ok(v) = std::env::var("HOMEWATCH_MOCK_SENSORS") {
        match v.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => cfg.mock_sensors = true,
            "false" | "0" => cfg.mock_sensors = false,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("HOMEWATCH_ACK_TIMEOUT_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.ack_timeout_ms = ms;
    }
}

/// Save the config to disk, creating `~/.homewatch/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| ConfigError::io(parent, e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // Owner read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| ConfigError::io(path, e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| ConfigError::io(path, e))?;
    Ok(())
}
