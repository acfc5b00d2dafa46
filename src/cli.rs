use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use log::LevelFilter;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::clipboard::{self, BackendKind};
use crate::logging;
use crate::models::read_capped;
use crate::monitor::Monitor;
use crate::process::{self, ShutdownFlag};
use crate::storage::{self, CacheStore, Config};

#[derive(Parser, Debug)]
#[command(version, about = "Selection monitor and clipboard helper", long_about = None)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
pub struct Cli {
    /// Directory for the published selection records
    pub cache_dir: Option<PathBuf>,

    /// Print the current PRIMARY selection once and exit
    #[arg(long, group = "mode")]
    pub oneshot: bool,

    /// Print the current clipboard content and exit
    #[arg(long, group = "mode")]
    pub get_clipboard: bool,

    /// Take the clipboard with the text on standard input
    #[arg(long, group = "mode")]
    pub copy_clipboard: bool,

    /// Drop PRIMARY ownership
    #[arg(long, group = "mode")]
    pub clear_primary: bool,
}

/// What this process does, fixed at start-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Daemon,
    Oneshot,
    GetClipboard,
    CopyClipboard,
    ClearPrimary,
}

impl Mode {
    /// Modes that outlive the invoking command and log to a file
    pub fn is_long_lived(self) -> bool {
        matches!(self, Mode::Daemon | Mode::CopyClipboard)
    }
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.oneshot {
            Mode::Oneshot
        } else if self.get_clipboard {
            Mode::GetClipboard
        } else if self.copy_clipboard {
            Mode::CopyClipboard
        } else if self.clear_primary {
            Mode::ClearPrimary
        } else {
            Mode::Daemon
        }
    }
}

/// Entry point shared by every binary
pub fn run(kind: BackendKind) -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are the only non-stderr outcomes
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let mode = cli.mode();

    let config = match storage::load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init_stderr_logger();
            eprintln!("selmon: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let file_logging = init_logging(mode, &config);

    match execute(kind, mode, cli.cache_dir.as_deref(), &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            if file_logging {
                // Echoed to stderr by the file logger while still attached
                log::error!("{:#}", e);
            } else {
                eprintln!("selmon: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

/// File logging for long-lived modes, stderr otherwise.
/// Returns whether the file logger is active.
fn init_logging(mode: Mode, config: &Config) -> bool {
    if !mode.is_long_lived() {
        logging::init_stderr_logger();
        return false;
    }

    let path = match &config.logging.file {
        Some(path) => Ok(path.clone()),
        None => storage::default_log_path(),
    };

    match path.and_then(|p| logging::init_logger(&p, &config.logging.level, LevelFilter::Warn)) {
        Ok(()) => true,
        Err(e) => {
            logging::init_stderr_logger();
            log::warn!("File logging unavailable, using stderr: {:#}", e);
            false
        }
    }
}

/// Run one mode. Ok(false) means nothing was produced: exit 1 without a message.
fn execute(kind: BackendKind, mode: Mode, cache_dir: Option<&Path>, config: &Config) -> Result<bool> {
    log::debug!("Running {:?} with backend {:?}", mode, kind);

    match mode {
        Mode::Daemon => cmd_daemon(kind, cache_dir, config),
        Mode::Oneshot => cmd_oneshot(kind, cache_dir, config),
        Mode::GetClipboard => {
            let mut backend = clipboard::create_backend(kind, config)?;
            let content = backend.read_clipboard()?;
            emit(content)
        }
        Mode::CopyClipboard => cmd_copy_clipboard(kind, config),
        Mode::ClearPrimary => {
            let mut backend = clipboard::create_backend(kind, config)?;
            backend.clear_primary()?;
            Ok(true)
        }
    }
}

/// Start the monitor daemon in the background
fn cmd_daemon(kind: BackendKind, cache_dir: Option<&Path>, config: &Config) -> Result<bool> {
    let dir = storage::resolve_cache_dir(cache_dir)?;
    let cache = CacheStore::open(&dir)?;

    if cache.daemon_alive() {
        log::info!("Monitor already running for {}", dir.display());
        return Ok(true);
    }

    // Setup failures surface here, before detaching, as an exit code
    let mut backend = clipboard::create_backend(kind, config)?;
    backend.prepare_daemon()?;
    let mut monitor = Monitor::start(cache.clone())?;

    let pid = process::spawn_detached(move || {
        monitor.set_shutdown(ShutdownFlag::install()?);
        log::info!(
            "{} monitor started for {}",
            backend.name(),
            monitor.cache().dir().display()
        );

        let result = backend.run_daemon(&mut monitor);
        monitor.finish();
        result
    })?;

    let pid = u32::try_from(pid.as_raw()).context("Invalid daemon pid")?;
    cache.write_pid(pid)?;
    log::info!("Monitor {} publishing to {}", pid, dir.display());
    Ok(true)
}

fn cmd_oneshot(kind: BackendKind, cache_dir: Option<&Path>, config: &Config) -> Result<bool> {
    let mut backend = clipboard::create_backend(kind, config)?;
    let content = backend.read_primary()?;

    if let Some(dir) = cache_dir {
        publish_oneshot(&CacheStore::open(dir)?, content.as_deref())?;
    }

    emit(content)
}

/// Keep a daemonless cache directory current. A live daemon owns the
/// records, so they are left alone then.
fn publish_oneshot(cache: &CacheStore, content: Option<&[u8]>) -> Result<()> {
    if cache.daemon_alive() {
        log::debug!("Daemon is live, leaving cache records alone");
        return Ok(());
    }

    let seq = match cache.read_seq() {
        Some(seq) => seq.saturating_add(1),
        None => u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(1),
    };
    cache.publish(content.unwrap_or_default(), seq)
}

fn cmd_copy_clipboard(kind: BackendKind, config: &Config) -> Result<bool> {
    let data = read_capped(io::stdin().lock(), config.limits.max_clipboard_bytes)
        .context("Failed to read standard input")?;

    let mut backend = clipboard::create_backend(kind, config)?;
    backend.write_clipboard(data)?;
    Ok(true)
}

/// Selection bytes to stdout as-is, no trailing newline
fn emit(content: Option<Vec<u8>>) -> Result<bool> {
    let Some(bytes) = content.filter(|b| !b.is_empty()) else {
        return Ok(false);
    };

    let mut stdout = io::stdout().lock();
    stdout
        .write_all(&bytes)
        .and_then(|()| stdout.flush())
        .context("Failed to write to standard output")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("selmon").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_mode_is_daemon() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.mode(), Mode::Daemon);
        assert_eq!(cli.cache_dir, None);
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(parse(&["--oneshot"]).unwrap().mode(), Mode::Oneshot);
        assert_eq!(parse(&["--get-clipboard"]).unwrap().mode(), Mode::GetClipboard);
        assert_eq!(parse(&["--copy-clipboard"]).unwrap().mode(), Mode::CopyClipboard);
        assert_eq!(parse(&["--clear-primary"]).unwrap().mode(), Mode::ClearPrimary);
    }

    #[test]
    fn test_cache_dir_with_mode() {
        let cli = parse(&["/tmp/sel", "--oneshot"]).unwrap();
        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/sel")));
        assert_eq!(cli.mode(), Mode::Oneshot);
    }

    #[test]
    fn test_modes_are_mutually_exclusive() {
        let err = parse(&["--oneshot", "--clear-primary"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        assert!(err.use_stderr());
    }

    #[test]
    fn test_help_is_not_an_error_exit() {
        let err = parse(&["--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert!(!err.use_stderr());
    }

    #[test]
    fn test_unknown_flag_fails() {
        assert!(parse(&["--watch"]).unwrap_err().use_stderr());
    }

    #[test]
    fn test_long_lived_modes() {
        assert!(Mode::Daemon.is_long_lived());
        assert!(Mode::CopyClipboard.is_long_lived());
        assert!(!Mode::Oneshot.is_long_lived());
        assert!(!Mode::ClearPrimary.is_long_lived());
    }

    #[test]
    fn test_oneshot_publishes_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        cache.publish(b"old", 41).unwrap();

        publish_oneshot(&cache, Some(b"new selection")).unwrap();
        assert_eq!(cache.read_seq(), Some(42));
        assert_eq!(cache.read_primary().unwrap(), b"new selection".to_vec());

        publish_oneshot(&cache, None).unwrap();
        assert_eq!(cache.read_seq(), Some(43));
        assert_eq!(cache.read_primary().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_oneshot_at_counter_limit_does_not_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        cache.publish(b"old", u64::MAX).unwrap();

        publish_oneshot(&cache, Some(b"x")).unwrap();
        assert_eq!(cache.read_seq(), Some(u64::MAX));
        assert_eq!(cache.read_primary().unwrap(), b"x".to_vec());
    }

    #[test]
    fn test_oneshot_leaves_live_daemon_records() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::open(dir.path()).unwrap();
        cache.publish(b"daemon owned", 7).unwrap();
        cache.write_pid(std::process::id()).unwrap();

        publish_oneshot(&cache, Some(b"other")).unwrap();
        assert_eq!(cache.read_seq(), Some(7));
        assert_eq!(cache.read_primary().unwrap(), b"daemon owned".to_vec());
    }

    #[test]
    fn test_empty_output_is_failure() {
        assert!(!emit(None).unwrap());
        assert!(!emit(Some(Vec::new())).unwrap());
    }
}
