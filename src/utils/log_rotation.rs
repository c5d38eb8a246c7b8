use anyhow::{Context, Result};
use chrono::Local;
use log::{debug, info};
use std::fs;
use std::path::Path;

/// Rotates the exported telemetry log once it passes a size threshold
pub struct LogRotationManager {
    max_size_bytes: u64,
}

impl LogRotationManager {
    pub fn new(max_size_bytes: u64) -> Self {
        Self { max_size_bytes }
    }

    pub fn should_rotate(&self, log_file_path: &Path) -> Result<bool> {
        if !log_file_path.exists() {
            return Ok(false);
        }

        let file_size = log_file_path
            .metadata()
            .with_context(|| format!("Failed to get metadata for: {}", log_file_path.display()))?
            .len();

        debug!(
            "Telemetry log size: {file_size} bytes, threshold: {} bytes",
            self.max_size_bytes
        );

        Ok(file_size > self.max_size_bytes)
    }

    /// Moves `log` to `log.bak`, replacing an older backup, and starts a
    /// new file with a rotation marker
    pub fn rotate_log(&self, log_file_path: &Path) -> Result<()> {
        if !log_file_path.exists() {
            debug!(
                "Log file does not exist, no rotation needed: {}",
                log_file_path.display()
            );
            return Ok(());
        }

        let backup_path = log_file_path.with_extension("bak");

        if backup_path.exists() {
            fs::remove_file(&backup_path).with_context(|| {
                format!("Failed to remove old backup file: {}", backup_path.display())
            })?;
        }

        fs::rename(log_file_path, &backup_path).with_context(|| {
            format!("Failed to rename log file to backup: {}", backup_path.display())
        })?;

        let rotation_msg = format!(
            "# {} - log rotated, previous entries in {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            backup_path.display()
        );

        fs::write(log_file_path, rotation_msg)
            .with_context(|| format!("Failed to create new log file: {}", log_file_path.display()))?;

        info!(
            "Telemetry log rotated: {} -> {}",
            log_file_path.display(),
            backup_path.display()
        );

        Ok(())
    }

    pub fn check_and_rotate(&self, log_file_path: &Path) -> Result<bool> {
        if self.should_rotate(log_file_path)? {
            self.rotate_log(log_file_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_only_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        let manager = LogRotationManager::new(8);

        fs::write(&log, "0,1,2\n").unwrap();
        assert!(!manager.check_and_rotate(&log).unwrap());

        fs::write(&log, "0,1,2,3,4,5\n").unwrap();
        assert!(manager.check_and_rotate(&log).unwrap());

        let backup = dir.path().join("log.bak");
        assert_eq!(fs::read_to_string(backup).unwrap(), "0,1,2,3,4,5\n");
        assert!(fs::read_to_string(&log).unwrap().starts_with("# "));
    }
}
