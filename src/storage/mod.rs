pub mod cache;
pub mod config;

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

pub use cache::CacheStore;
pub use config::{Config, ConfigStorage, LimitsConfig, LoggingConfig, TimingConfig, TomlConfigStorage};

const APP_DIR: &str = "selmon";

/// Resolve the cache directory without touching the filesystem beyond
/// checking whether the per-user runtime root exists.
///
/// Precedence:
/// - explicit argument
/// - $XDG_RUNTIME_DIR/selmon, or /run/user/<uid>/selmon when that root exists
/// - $HOME/.cache/selmon
pub fn resolve_cache_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    let runtime_root = env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .or_else(|| {
            let candidate = PathBuf::from(format!("/run/user/{}", nix::unistd::getuid()));
            candidate.is_dir().then_some(candidate)
        });
    let home = env::var_os("HOME").map(PathBuf::from);

    pick_cache_dir(explicit, runtime_root, home)
}

fn pick_cache_dir(
    explicit: Option<&Path>,
    runtime_root: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }

    if let Some(root) = runtime_root.filter(|r| !r.as_os_str().is_empty()) {
        return Ok(root.join(APP_DIR));
    }

    let home = home.context("Neither XDG_RUNTIME_DIR nor HOME is set, pass a cache directory")?;
    Ok(home.join(".cache").join(APP_DIR))
}

/// Config file location
///
/// - $SELMON_CONFIG when set
/// - $XDG_CONFIG_HOME/selmon/selmon.toml (default: ~/.config/selmon/selmon.toml)
pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os("SELMON_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let config_dir = if let Some(xdg_config) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join(APP_DIR)
    } else {
        let home = env::var("HOME").context("HOME environment variable not set")?;
        PathBuf::from(home).join(".config").join(APP_DIR)
    };

    Ok(config_dir.join("selmon.toml"))
}

/// Default log file: $XDG_STATE_HOME/selmon/selmon.log (default: ~/.local/state/selmon)
pub fn default_log_path() -> Result<PathBuf> {
    let state_dir = if let Some(xdg_state) = env::var_os("XDG_STATE_HOME") {
        PathBuf::from(xdg_state).join(APP_DIR)
    } else {
        let home = env::var("HOME").context("HOME environment variable not set")?;
        PathBuf::from(home).join(".local/state").join(APP_DIR)
    };

    Ok(state_dir.join("selmon.log"))
}

/// Load the configuration from its default location
pub fn load_config() -> Result<Config> {
    TomlConfigStorage::new(config_path()?).load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_dir_wins() {
        let dir = pick_cache_dir(
            Some(Path::new("/tmp/custom")),
            Some(PathBuf::from("/run/user/1000")),
            Some(PathBuf::from("/home/u")),
        )
        .unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/custom"));
    }

    #[test]
    fn test_runtime_dir_before_home() {
        let dir = pick_cache_dir(
            None,
            Some(PathBuf::from("/run/user/1000")),
            Some(PathBuf::from("/home/u")),
        )
        .unwrap();
        assert_eq!(dir, PathBuf::from("/run/user/1000/selmon"));
    }

    #[test]
    fn test_home_fallback() {
        let dir = pick_cache_dir(None, None, Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(dir, PathBuf::from("/home/u/.cache/selmon"));

        let dir = pick_cache_dir(None, Some(PathBuf::new()), Some(PathBuf::from("/home/u"))).unwrap();
        assert_eq!(dir, PathBuf::from("/home/u/.cache/selmon"));
    }

    #[test]
    fn test_nothing_to_resolve_is_an_error() {
        assert!(pick_cache_dir(None, None, None).is_err());
    }
}
