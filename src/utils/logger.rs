use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use once_cell::sync::Lazy;

// Console logger, filtering is left to log::max_level
struct CustomLogger;

impl log::Log for CustomLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        println!("[{}][{}]: {}", timestamp, record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Lazy<CustomLogger> = Lazy::new(|| CustomLogger);

pub fn init_logger<P: AsRef<Path>>(level_path: P) -> Result<()> {
    let level_path = level_path.as_ref();
    let log_level = read_log_level_config(level_path);

    log::set_logger(&*LOGGER)
        .map(|()| log::set_max_level(log_level))
        .with_context(|| "Failed to set logger")?;

    log::info!("Logger initialized with level: {log_level}");
    log::info!("Log level config path: {}", level_path.display());
    log::debug!("Update-path diagnostics are rate limited");

    Ok(())
}

pub fn parse_log_level(content: &str) -> Option<LevelFilter> {
    match content.trim().to_lowercase().as_str() {
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// Missing or unreadable level files fall back to Info
pub fn read_log_level_config(level_path: &Path) -> LevelFilter {
    let default_level = LevelFilter::Info;

    if !level_path.exists() {
        return default_level;
    }

    match std::fs::read_to_string(level_path) {
        Ok(content) => parse_log_level(&content).unwrap_or(default_level),
        Err(_) => default_level,
    }
}

pub fn update_log_level(level_path: &Path) {
    let new_level = read_log_level_config(level_path);
    log::set_max_level(new_level);
    log::info!("Log level updated to: {new_level}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels_case_insensitively() {
        assert_eq!(parse_log_level("DEBUG\n"), Some(LevelFilter::Debug));
        assert_eq!(parse_log_level(" warn "), Some(LevelFilter::Warn));
        assert_eq!(parse_log_level("verbose"), None);
    }

    #[test]
    fn init_logger_applies_level_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_level");
        std::fs::write(&path, "warn").unwrap();

        init_logger(&path).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Warn);

        // a second logger cannot be installed
        assert!(init_logger(&path).is_err());
    }

    #[test]
    fn missing_level_file_defaults_to_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log_level");
        assert_eq!(read_log_level_config(&path), LevelFilter::Info);

        std::fs::write(&path, "error").unwrap();
        assert_eq!(read_log_level_config(&path), LevelFilter::Error);
    }
}
