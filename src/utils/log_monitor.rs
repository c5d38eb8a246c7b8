use std::{path::Path, thread, time::Duration};

use anyhow::Result;
use inotify::WatchMask;
use log::{debug, info, warn};

use crate::utils::{file_operate::check_read_simple, inotify::InotifyWatcher, logger::update_log_level};

pub fn monitor_log_level(level_path: &Path) -> Result<()> {
    info!("LogLevelMonitor Start");

    if !check_read_simple(level_path) {
        info!("Log level file does not exist: {}", level_path.display());
        return Ok(());
    }
    info!("Using log level path: {}", level_path.display());

    let mut inotify = InotifyWatcher::new()?;
    inotify.add(level_path, WatchMask::CLOSE_WRITE | WatchMask::MODIFY)?;

    loop {
        if let Err(e) = inotify.wait_and_handle() {
            warn!("Inotify error in log level monitor: {e}");
            thread::sleep(Duration::from_secs(1));
            continue;
        }

        if inotify.is_empty() {
            warn!("Log level file watch lost, monitor exiting");
            return Ok(());
        }

        if !check_read_simple(level_path) {
            debug!("Log level file no longer exists");
            continue;
        }

        update_log_level(level_path);
    }
}
