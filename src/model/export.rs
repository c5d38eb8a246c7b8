use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    datasource::file_path::{EXPORT_INFO_FILE, EXPORT_LOG_FILE},
    error::GovernorResult,
    model::ring_buffer::{Snapshot, TelemetryRingBuffer},
    utils::{constants::cpufreq::NSEC_PER_MSEC, file_operate::append_file, log_rotation::LogRotationManager},
    warn_ratelimited,
};

pub const OVERFLOW_WARNING: &str = "# ring buffer wrapped around, older entries were lost";

/// Static description of a running governor for offline tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoFile {
    pub core_count: usize,
    pub update_interval_ms: u64,
    pub logbuffer_size: usize,
}

impl InfoFile {
    pub fn new(core_count: usize, update_interval_ns: u64, logbuffer_size: usize) -> Self {
        Self {
            core_count,
            update_interval_ms: update_interval_ns / NSEC_PER_MSEC,
            logbuffer_size,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "core_count={}\nupdate_interval={}\nlogbuffer_size={}\n",
            self.core_count, self.update_interval_ms, self.logbuffer_size
        )
    }
}

/// One text line per entry, preceded by a warning when entries were lost
pub fn format_snapshot(snapshot: &Snapshot) -> Vec<String> {
    let mut lines = Vec::with_capacity(snapshot.entries.len() + 1);
    if snapshot.overflowed {
        lines.push(OVERFLOW_WARNING.to_string());
    }
    lines.extend(snapshot.entries.iter().map(ToString::to_string));
    lines
}

/// Accumulates exported log text for every started domain
pub struct ExportSink {
    dir: Option<PathBuf>,
    capacity: usize,
    info: String,
    text: Mutex<String>,
    rotation: LogRotationManager,
}

impl ExportSink {
    /// Writes `<dir>/info` when an export directory is configured
    pub fn create(
        dir: Option<&Path>,
        capacity: usize,
        rotate_bytes: u64,
        info: &InfoFile,
    ) -> GovernorResult<Self> {
        let rendered = info.render();
        if let Some(dir) = dir {
            fs::create_dir_all(dir)?;
            fs::write(dir.join(EXPORT_INFO_FILE), &rendered)?;
            info!("Export directory: {}", dir.display());
        }
        debug!("Info:\n{rendered}");

        Ok(Self {
            dir: dir.map(Path::to_path_buf),
            capacity,
            info: rendered,
            text: Mutex::new(String::new()),
            rotation: LogRotationManager::new(rotate_bytes),
        })
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Bytes of text waiting for the next flush
    pub fn len(&self) -> usize {
        self.text.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_lines(&self, lines: &[String]) {
        let mut text = self.text.lock();
        for line in lines {
            let needed = line.len() + 1;
            if text.len() + needed > self.capacity {
                warn_ratelimited!("Export log is getting too large, force clear");
                text.clear();
            }
            if needed > self.capacity {
                warn_ratelimited!("Cleared export log is too small for a {needed} byte line");
                continue;
            }
            text.push_str(line);
            text.push('\n');
        }
    }

    /// Drains one ring buffer into the text; returns the number of entries taken
    pub fn collect(&self, ring: &TelemetryRingBuffer) -> usize {
        let snapshot = ring.snapshot_and_clear();
        if snapshot.overflowed {
            warn_ratelimited!("Ring buffer had wraparound, loss of data");
        }
        let count = snapshot.entries.len();
        self.append_lines(&format_snapshot(&snapshot));
        count
    }

    pub fn take_text(&self) -> String {
        std::mem::take(&mut *self.text.lock())
    }

    /// Appends the accumulated text to `<dir>/log`; without a directory the
    /// text is kept for `take_text`
    pub fn flush(&self) -> Result<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let text = self.take_text();
        let log_path = dir.join(EXPORT_LOG_FILE);
        let written = self
            .rotation
            .check_and_rotate(&log_path)
            .and_then(|_| append_file(&log_path, text.as_bytes()));
        if written.is_err() {
            self.restore_text(text);
        }
        written
    }

    /// Puts unwritten text back ahead of anything collected since
    fn restore_text(&self, text: String) {
        let mut pending = self.text.lock();
        let newer = std::mem::replace(&mut *pending, text);
        pending.push_str(&newer);
    }
}

impl Drop for ExportSink {
    fn drop(&mut self) {
        match self.flush() {
            Ok(n) if n > 0 => debug!("Flushed {n} bytes on sink release"),
            Ok(_) => {}
            Err(e) => warn!("Failed to flush export log: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ring_buffer::LogEntry;

    fn entry(n: u64) -> LogEntry {
        LogEntry {
            timestamp: n,
            perf_values: [1, 2, 3],
            requested_freq: 1000,
            unit_id: 0,
        }
    }

    #[test]
    fn info_file_format() {
        let info = InfoFile::new(8, 5_000_000, 2000);
        assert_eq!(info.render(), "core_count=8\nupdate_interval=5\nlogbuffer_size=2000\n");
    }

    #[test]
    fn overflow_warning_leads_once() {
        let snapshot = Snapshot {
            entries: vec![entry(1), entry(2)],
            overflowed: true,
        };
        let lines = format_snapshot(&snapshot);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], OVERFLOW_WARNING);
        assert_eq!(lines[1], "0,1,1,2,3,1000");
        assert_eq!(lines.iter().filter(|l| l.starts_with('#')).count(), 1);

        let clean = format_snapshot(&Snapshot {
            entries: vec![entry(1)],
            overflowed: false,
        });
        assert_eq!(clean, vec!["0,1,1,2,3,1000".to_string()]);
    }

    #[test]
    fn capacity_forces_clear() {
        let sink = ExportSink::create(None, 10, 1024, &InfoFile::new(1, 0, 1)).unwrap();
        sink.append_lines(&["aaaa".into(), "bbbb".into()]);
        assert_eq!(sink.len(), 10);
        sink.append_lines(&["cc".into()]);
        assert_eq!(sink.take_text(), "cc\n");
        sink.append_lines(&["this line is too long".into()]);
        assert!(sink.is_empty());
    }

    #[test]
    fn failed_flush_keeps_pending_text() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ExportSink::create(Some(dir.path()), 4096, 1 << 20, &InfoFile::new(1, 0, 1)).unwrap();
        // appending to a directory fails
        fs::create_dir(dir.path().join(EXPORT_LOG_FILE)).unwrap();

        sink.append_lines(&["0,1,1,2,3,1000".into()]);
        assert!(sink.flush().is_err());
        assert_eq!(sink.len(), "0,1,1,2,3,1000\n".len());

        sink.append_lines(&["0,2,1,2,3,1000".into()]);
        fs::remove_dir(dir.path().join(EXPORT_LOG_FILE)).unwrap();
        assert!(sink.flush().unwrap() > 0);
        assert!(sink.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join(EXPORT_LOG_FILE)).unwrap(),
            "0,1,1,2,3,1000\n0,2,1,2,3,1000\n"
        );
    }

    #[test]
    fn collect_and_flush_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let export = dir.path().join("export");
        let sink =
            ExportSink::create(Some(&export), 4096, 1 << 20, &InfoFile::new(2, 5_000_000, 4)).unwrap();
        assert_eq!(
            fs::read_to_string(export.join(EXPORT_INFO_FILE)).unwrap(),
            "core_count=2\nupdate_interval=5\nlogbuffer_size=4\n"
        );

        let ring = TelemetryRingBuffer::new(4).unwrap();
        for n in 0..6 {
            ring.append(entry(n));
        }
        assert_eq!(sink.collect(&ring), 4);
        assert!(sink.flush().unwrap() > 0);
        assert!(sink.is_empty());

        let log = fs::read_to_string(export.join(EXPORT_LOG_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[0], OVERFLOW_WARNING);
        assert_eq!(lines[1], "0,2,1,2,3,1000");
        assert_eq!(lines.len(), 5);
    }
}
