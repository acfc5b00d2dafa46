use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process;
use std::sync::Mutex;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Logger for the long-lived processes: rotating file plus a stderr echo
/// that goes quiet once the process has detached
struct SelmonLogger {
    file_writer: Mutex<RollingFileAppender>,
    file_level: LevelFilter,
    stderr_level: LevelFilter,
}

impl Log for SelmonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.file_level || metadata.level() <= self.stderr_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = record.level();

        if level <= self.file_level {
            if let Ok(mut writer) = self.file_writer.lock() {
                // Daemon and clipboard server share a file; the pid tells them apart
                let _ = writeln!(
                    writer,
                    "{}",
                    format_line(chrono::Local::now(), level, process::id(), record.args())
                );
            }
        }

        if level <= self.stderr_level {
            eprintln!("selmon: {}", record.args());
        }
    }

    fn flush(&self) {
        if let Ok(mut writer) = self.file_writer.lock() {
            let _ = writer.flush();
        }
    }
}

fn format_line(
    timestamp: chrono::DateTime<chrono::Local>,
    level: Level,
    pid: u32,
    message: impl std::fmt::Display,
) -> String {
    format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        level,
        pid,
        message
    )
}

/// Parse log level string to LevelFilter
pub fn parse_level(level_str: &str) -> LevelFilter {
    match level_str.to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rolling_appender(log_file_path: &Path) -> Result<RollingFileAppender> {
    let dir = log_file_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", log_file_path.display()))?;
    fs::create_dir_all(dir).context("Failed to create log directory")?;

    // Daily rotation, three files kept
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(3)
        .filename_prefix(
            log_file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("selmon"),
        )
        .filename_suffix(
            log_file_path
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or("log"),
        )
        .build(dir)
        .context("Failed to create rotating file appender")
}

/// Install the file logger for daemon and clipboard-server processes
pub fn init_logger(log_file_path: &Path, file_level: &str, stderr_level: LevelFilter) -> Result<()> {
    let file_level = parse_level(file_level);

    let logger = SelmonLogger {
        file_writer: Mutex::new(rolling_appender(log_file_path)?),
        file_level,
        stderr_level,
    };

    log::set_boxed_logger(Box::new(logger)).context("Failed to set global logger")?;
    log::set_max_level(file_level.max(stderr_level));

    Ok(())
}

/// Stderr-only logging for short-lived modes. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_stderr_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("warn"), LevelFilter::Warn);
        assert_eq!(parse_level("off"), LevelFilter::Off);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn test_format_line_carries_pid() {
        let ts = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        let line = format_line(ts, Level::Warn, 4242, "owner vanished");
        assert_eq!(line, "2024-03-09 14:05:00.000 [WARN] [4242] owner vanished");
    }

    #[test]
    fn test_file_logger_respects_level() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SelmonLogger {
            file_writer: Mutex::new(rolling_appender(&dir.path().join("selmon.log")).unwrap()),
            file_level: LevelFilter::Info,
            stderr_level: LevelFilter::Off,
        };

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .args(format_args!("published seq 7"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Debug)
                .args(format_args!("hidden detail"))
                .build(),
        );
        logger.flush();

        let contents: String = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert!(contents.contains("[INFO]"));
        assert!(contents.contains("published seq 7"));
        assert!(!contents.contains("hidden detail"));
    }
}
