use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resource caps applied per read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest selection read from another client; longer content is truncated
    #[serde(default = "default_max_selection_bytes")]
    pub max_selection_bytes: usize,

    /// Largest payload accepted on stdin by --copy-clipboard
    #[serde(default = "default_max_clipboard_bytes")]
    pub max_clipboard_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_selection_bytes: default_max_selection_bytes(),
            max_clipboard_bytes: default_max_clipboard_bytes(),
        }
    }
}

/// Event loop and handshake timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Poll wait of every event loop, also the offer re-check interval on Wayland
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// X11 clipboard server exits after this long without a paste request
    #[serde(default = "default_clipboard_idle_secs")]
    pub clipboard_idle_secs: u64,

    /// How long one-shot reads wait for a focus-gated selection event
    #[serde(default = "default_focus_wait_ms")]
    pub focus_wait_ms: u64,

    /// How long to wait for an input serial before taking Wayland ownership
    #[serde(default = "default_serial_wait_ms")]
    pub serial_wait_ms: u64,

    /// Wait for the first bytes of a Wayland offer transfer
    #[serde(default = "default_pipe_first_timeout_ms")]
    pub pipe_first_timeout_ms: u64,

    /// Wait for each following chunk of a Wayland offer transfer
    #[serde(default = "default_pipe_next_timeout_ms")]
    pub pipe_next_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            tick_ms: default_tick_ms(),
            clipboard_idle_secs: default_clipboard_idle_secs(),
            focus_wait_ms: default_focus_wait_ms(),
            serial_wait_ms: default_serial_wait_ms(),
            pipe_first_timeout_ms: default_pipe_first_timeout_ms(),
            pipe_next_timeout_ms: default_pipe_next_timeout_ms(),
        }
    }
}

impl TimingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn clipboard_idle(&self) -> Duration {
        Duration::from_secs(self.clipboard_idle_secs)
    }

    pub fn focus_wait(&self) -> Duration {
        Duration::from_millis(self.focus_wait_ms)
    }

    pub fn serial_wait(&self) -> Duration {
        Duration::from_millis(self.serial_wait_ms)
    }

    pub fn pipe_first_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_first_timeout_ms)
    }

    pub fn pipe_next_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_next_timeout_ms)
    }
}

/// Log output of the long-lived processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Overrides the default log file under the XDG state directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

// Default value functions for serde
fn default_max_selection_bytes() -> usize {
    1_048_576 // 1MB
}

fn default_max_clipboard_bytes() -> usize {
    8_388_608 // 8MB
}

fn default_tick_ms() -> u64 {
    50
}

fn default_clipboard_idle_secs() -> u64 {
    60
}

fn default_focus_wait_ms() -> u64 {
    3000
}

fn default_serial_wait_ms() -> u64 {
    1000
}

fn default_pipe_first_timeout_ms() -> u64 {
    500
}

fn default_pipe_next_timeout_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Trait for configuration storage
pub trait ConfigStorage {
    /// Load configuration, falling back to defaults when no file exists
    fn load(&self) -> Result<Config>;

    /// Get the config file path
    fn path(&self) -> &PathBuf;
}

/// TOML-based implementation of ConfigStorage
pub struct TomlConfigStorage {
    path: PathBuf,
}

impl TomlConfigStorage {
    /// Create a new TomlConfigStorage with the given path
    pub fn new(path: PathBuf) -> Self {
        TomlConfigStorage { path }
    }
}

impl ConfigStorage for TomlConfigStorage {
    fn load(&self) -> Result<Config> {
        // The helper runs on hot paths, so a missing file is never created here
        if !self.path.exists() {
            log::debug!("No config at {:?}, using defaults", self.path);
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config from {:?}", self.path))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", self.path))?;

        log::debug!(
            "Loaded configuration from {:?}: max_selection={} tick={}ms",
            self.path,
            config.limits.max_selection_bytes,
            config.timing.tick_ms
        );

        Ok(config)
    }

    fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.limits.max_selection_bytes, 1_048_576);
        assert_eq!(config.limits.max_clipboard_bytes, 8_388_608);
        assert_eq!(config.timing.tick(), Duration::from_millis(50));
        assert_eq!(config.timing.clipboard_idle(), Duration::from_secs(60));
        assert_eq!(config.timing.focus_wait(), Duration::from_secs(3));
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let toml_str = r#"
        [timing]
        clipboard_idle_secs = 15

        [logging]
        level = "debug"
        file = "/tmp/selmon.log"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.timing.clipboard_idle_secs, 15);
        assert_eq!(config.timing.tick_ms, 50);
        assert_eq!(config.limits.max_selection_bytes, 1_048_576);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/selmon.log")));
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        let timing = TimingConfig {
            tick_ms: 0,
            ..TimingConfig::default()
        };
        assert_eq!(timing.tick(), Duration::from_millis(1));
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TomlConfigStorage::new(dir.path().join("selmon.toml"));
        let config = storage.load().unwrap();
        assert_eq!(config.timing.pipe_first_timeout_ms, 500);
        assert!(!storage.path().exists());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selmon.toml");
        fs::write(&path, "[limits\nmax_selection_bytes = ").unwrap();
        assert!(TomlConfigStorage::new(path).load().is_err());
    }
}
