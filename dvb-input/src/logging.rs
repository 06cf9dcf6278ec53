//! Logging with console and file output.
//!
//! Library code logs through the `log` macros; they are bridged into a
//! `tracing` subscriber with a console layer and a daily rotated file
//! layer. Rotated files older than the retention window are removed at
//! start-up.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Prefix of every log file name.
pub const LOG_FILE_NAME: &str = "dvb-input.log";

/// Initialize logging.
///
/// The level comes from `RUST_LOG`, then `level`, then `debug` or `info`
/// depending on `verbose`. Keep the returned guard alive for as long as
/// file output is wanted.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    clean_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = level.unwrap_or(if verbose { "debug" } else { "info" });
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_timer(LocalTimeTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_level(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimeTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to set default subscriber: {}", e))?;
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to initialize LogTracer: {}", e))?;

    Ok(guard)
}

/// Remove log files last modified more than `retention_days` ago.
/// Returns how many were removed.
pub fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with(LOG_FILE_NAME));
        if !is_log || !path.is_file() {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let modified: chrono::DateTime<Local> = modified.into();
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }

    Ok(removed)
}

/// Local time with microseconds.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dvb-input-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_recent_logs_are_kept() {
        let dir = scratch_dir();
        fs::write(dir.join("dvb-input.log.2026-10-14"), b"x").unwrap();
        assert_eq!(clean_old_logs(&dir, 7).unwrap(), 0);
        assert!(dir.join("dvb-input.log.2026-10-14").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_other_files_are_ignored() {
        let dir = scratch_dir();
        fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        // zero retention would remove any log file
        assert_eq!(clean_old_logs(&dir, 0).unwrap(), 0);
        assert!(dir.join("notes.txt").exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_dir() {
        assert_eq!(clean_old_logs(Path::new("/nonexistent/logs"), 7).unwrap(), 0);
    }
}
