use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::Path,
};

use anyhow::{Context, Result};
use log::debug;

pub fn check_read_simple<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists() && path.as_ref().is_file()
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path_ref = path.as_ref();
    let mut file = File::open(path_ref)
        .with_context(|| format!("Failed to open file for reading: {}", path_ref.display()))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Failed to read from file: {}", path_ref.display()))?;

    Ok(content)
}

/// Reads a sysfs-style node holding a single unsigned integer
pub fn read_u64<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path_ref = path.as_ref();
    let buf = read_file(path_ref)?;
    buf.trim()
        .parse::<u64>()
        .with_context(|| format!("Failed to parse integer from {}", path_ref.display()))
}

/// Parses a whitespace separated unit list such as `related_cpus`
pub fn read_unit_list<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path_ref = path.as_ref();
    let buf = read_file(path_ref)?;
    buf.split_whitespace()
        .map(|part| {
            part.parse::<u32>()
                .with_context(|| format!("Bad unit id \"{part}\" in {}", path_ref.display()))
        })
        .collect()
}

pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<usize> {
    let path_ref = path.as_ref();

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path_ref)
        .with_context(|| format!("Failed to open file for writing: {}", path_ref.display()))?;

    let content_ref = content.as_ref();
    file.write_all(content_ref)
        .with_context(|| format!("Failed to write to file: {}", path_ref.display()))?;

    Ok(content_ref.len())
}

pub fn append_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<usize> {
    let path_ref = path.as_ref();
    let content_ref = content.as_ref();
    if content_ref.is_empty() {
        return Ok(0);
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path_ref)
        .with_context(|| format!("Failed to open file for appending: {}", path_ref.display()))?;

    file.write_all(content_ref)
        .with_context(|| format!("Failed to append to file: {}", path_ref.display()))?;

    Ok(content_ref.len())
}

/// Like [`write_file`], but a missing node is skipped instead of created
pub fn write_existing<P: AsRef<Path>>(path: P, content: &str) -> Result<usize> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        debug!("Node does not exist, skipping write: {}", path_ref.display());
        return Ok(0);
    }
    fs::write(path_ref, content)
        .with_context(|| format!("Failed to write file: {}", path_ref.display()))?;
    Ok(content.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers_trim_and_parse() {
        let dir = tempfile::tempdir().unwrap();
        let freq = dir.path().join("cpuinfo_max_freq");
        fs::write(&freq, "3000000\n").unwrap();
        assert_eq!(read_u64(&freq).unwrap(), 3_000_000);

        let cpus = dir.path().join("related_cpus");
        fs::write(&cpus, "0 1 2 3\n").unwrap();
        assert_eq!(read_unit_list(&cpus).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn append_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        append_file(&log, "a\n").unwrap();
        append_file(&log, "b\n").unwrap();
        assert_eq!(read_file(&log).unwrap(), "a\nb\n");
    }

    #[test]
    fn write_existing_skips_missing_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("scaling_setspeed");
        assert_eq!(write_existing(&missing, "1000").unwrap(), 0);
        assert!(!missing.exists());
    }
}
