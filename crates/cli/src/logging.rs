//! Subscriber setup.
//!
//! Session logs are filed by mode and date:
//! `<dir>/<mode>/<year>/<month>/<day>/<name>.log`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime};
use straddle_core::TradingMode;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level.
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[must_use]
pub fn log_path(dir: &Path, mode: TradingMode, now: NaiveDateTime, name: &str) -> PathBuf {
    dir.join(mode.to_string())
        .join(now.year().to_string())
        .join(now.month().to_string())
        .join(now.day().to_string())
        .join(format!("{name}.log"))
}

/// Logs to stderr, for the short-lived commands.
pub fn init_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .init();
}

/// Appends to the session's dated log file, creating directories as needed.
/// Returns the file path.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn init_session(
    dir: &Path,
    mode: TradingMode,
    now: NaiveDateTime,
    name: &str,
    default_level: &str,
) -> Result<PathBuf> {
    let path = log_path(dir, mode, now, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn logs_are_filed_by_mode_and_date() {
        let now = NaiveDate::from_ymd_opt(2021, 11, 5)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let path = log_path(Path::new("logs"), TradingMode::Paper, now, "session");
        assert_eq!(path, PathBuf::from("logs/paper/2021/11/5/session.log"));
    }
}
