//! Logging setup for processes embedding the ledger core.
//!
//! Output goes to the console, to `run.log` in a log directory, or both. The
//! log of the previous run is archived on startup and old archives are pruned.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

/// Prefix of archived log files.
const LOG_FILE_PREFIX: &str = "ledger-core.";
/// Name of the log file written by the current run.
const ACTIVE_LOG_NAME: &str = "run.log";
/// Archived logs kept by default.
pub const DEFAULT_MAX_LOG_FILES: usize = 20;

/// Keeps the background log writer alive. Buffered entries are flushed when
/// it is dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter; `RUST_LOG`, then INFO, when unset.
    pub level: Option<LevelFilter>,
    /// Write to stderr.
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Archived logs to keep besides `run.log`.
    pub max_files: usize,
}

impl LogFileConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            max_files: DEFAULT_MAX_LOG_FILES,
        }
    }
}

/// Console-only logging at `level`.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: None,
    })
}

/// Installs the global tracing subscriber described by `config`.
///
/// With neither console nor file output nothing is installed and the tracing
/// macros stay no-ops.
///
/// # Errors
///
/// Fails if the log directory cannot be prepared or a global subscriber is
/// already installed.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, guard) = match &config.file {
        Some(file_config) => {
            let (writer, guard) = open_log_file(file_config)?;
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let console_layer = config.console.then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: guard,
    })
}

/// Prepares the log directory and opens a fresh `run.log`.
fn open_log_file(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_previous_log(&config.log_dir)?;
    prune_archived_logs(&config.log_dir, config.max_files)?;

    let file = File::create(config.log_dir.join(ACTIVE_LOG_NAME))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Renames an existing `run.log` to `ledger-core.<date>.<time>.log`, stamped
/// with its modification time.
fn archive_previous_log(log_dir: &Path) -> LoggingResult<()> {
    let active = log_dir.join(ACTIVE_LOG_NAME);
    if !active.exists() {
        return Ok(());
    }

    let stamp = modification_time(&active).unwrap_or_else(Local::now).format("%Y-%m-%d.%H%M%S");
    let mut target = log_dir.join(format!("{}{}.log", LOG_FILE_PREFIX, stamp));
    let mut suffix = 0u32;
    while target.exists() {
        suffix += 1;
        if suffix > 999 {
            return Err(LoggingError::RotationFailed(format!(
                "too many archived logs stamped {}",
                stamp
            )));
        }
        target = log_dir.join(format!("{}{}-{}.log", LOG_FILE_PREFIX, stamp, suffix));
    }

    fs::rename(&active, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))
}

fn modification_time(path: &Path) -> Option<DateTime<Local>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::from(modified))
}

fn is_archived_log(name: &str) -> bool {
    name.starts_with(LOG_FILE_PREFIX) && name.ends_with(".log")
}

/// Deletes the oldest archives until at most `max_files` remain.
fn prune_archived_logs(log_dir: &Path, max_files: usize) -> LoggingResult<()> {
    let mut archives: Vec<_> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("failed to read log dir: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().map(is_archived_log).unwrap_or(false))
        .collect();
    if archives.len() <= max_files {
        return Ok(());
    }

    archives.sort_by_key(|entry| entry.metadata().and_then(|m| m.modified()).ok());
    let excess = archives.len() - max_files;
    for entry in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(entry.path()) {
            tracing::warn!("Failed to remove archived log {:?}: {}", entry.path(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    fn archived(log_dir: &Path) -> Vec<String> {
        fs::read_dir(log_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| is_archived_log(name))
            .collect()
    }

    fn write_archive(log_dir: &Path, day: u32) {
        let mut file = File::create(log_dir.join(format!("ledger-core.2026-03-{:02}.080000.log", day))).unwrap();
        writeln!(file, "day {}", day).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    #[test]
    fn test_archive_without_active_log_is_noop() {
        let dir = TempDir::new().unwrap();
        archive_previous_log(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_archive_keeps_content() {
        let dir = TempDir::new().unwrap();
        let mut file = File::create(dir.path().join(ACTIVE_LOG_NAME)).unwrap();
        writeln!(file, "INFO added block at height 7").unwrap();
        drop(file);

        archive_previous_log(dir.path()).unwrap();

        assert!(!dir.path().join(ACTIVE_LOG_NAME).exists());
        let names = archived(dir.path());
        assert_eq!(names.len(), 1);
        let content = fs::read_to_string(dir.path().join(&names[0])).unwrap();
        assert!(content.contains("height 7"));
    }

    #[test]
    fn test_archive_name_collision_gets_suffix() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            File::create(dir.path().join(ACTIVE_LOG_NAME)).unwrap();
            archive_previous_log(dir.path()).unwrap();
        }
        assert_eq!(archived(dir.path()).len(), 2);
    }

    #[test]
    fn test_prune_keeps_newest_and_other_files() {
        let dir = TempDir::new().unwrap();
        for day in 1..=6 {
            write_archive(dir.path(), day);
        }
        File::create(dir.path().join(ACTIVE_LOG_NAME)).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();

        prune_archived_logs(dir.path(), 2).unwrap();

        let mut names = archived(dir.path());
        names.sort();
        assert_eq!(
            names,
            vec!["ledger-core.2026-03-05.080000.log", "ledger-core.2026-03-06.080000.log"]
        );
        assert!(dir.path().join(ACTIVE_LOG_NAME).exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_prune_to_zero() {
        let dir = TempDir::new().unwrap();
        for day in 1..=3 {
            write_archive(dir.path(), day);
        }
        prune_archived_logs(dir.path(), 0).unwrap();
        assert!(archived(dir.path()).is_empty());
    }

    #[test]
    fn test_open_log_file_creates_nested_directory() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("data").join("logs");
        File::create(dir.path().join("unrelated")).unwrap();

        let config = LogFileConfig {
            log_dir: log_dir.clone(),
            max_files: 3,
        };
        assert!(open_log_file(&config).is_ok());
        assert!(log_dir.join(ACTIVE_LOG_NAME).exists());
    }

    #[test]
    fn test_init_without_outputs_succeeds() {
        let guard = init_logging(LoggingConfig {
            level: Some(LevelFilter::DEBUG),
            console: false,
            file: None,
        });
        assert!(guard.is_ok());
    }

    #[test]
    fn test_modification_time_of_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(modification_time(&dir.path().join("missing")).is_none());
    }
}
