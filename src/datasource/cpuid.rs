use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils::file_operate::read_file;

static CPUINFO_FIELD: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?m)^(vendor_id|cpu family|model|stepping)\s*:\s*(.*)$").ok()
});

/// The fields of the first processor block in `/proc/cpuinfo` that identify a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuIdentity {
    pub vendor: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

impl CpuIdentity {
    /// `vendor-family-MODEL-STEPPING`, family in decimal, the rest in uppercase hex
    pub fn cpuid_str(&self) -> String {
        format!(
            "{}-{}-{:X}-{:X}",
            self.vendor, self.family, self.model, self.stepping
        )
    }
}

pub fn parse_cpuinfo(content: &str) -> Option<CpuIdentity> {
    let re = CPUINFO_FIELD.as_ref()?;
    let (mut vendor, mut family, mut model, mut stepping) = (None, None, None, None);

    // only the first processor block
    let first = content.split("\n\n").next().unwrap_or_default();
    for caps in re.captures_iter(first) {
        let value = caps[2].trim();
        match &caps[1] {
            "vendor_id" => vendor = Some(value.to_string()),
            "cpu family" => family = value.parse().ok(),
            "model" => model = value.parse().ok(),
            "stepping" => stepping = value.parse().ok(),
            _ => {}
        }
    }

    Some(CpuIdentity {
        vendor: vendor?,
        family: family?,
        model: model?,
        stepping: stepping?,
    })
}

pub fn read_cpuid<P: AsRef<Path>>(cpuinfo_path: P) -> Result<String> {
    let cpuinfo_path = cpuinfo_path.as_ref();
    let content = read_file(cpuinfo_path)?;
    let identity = parse_cpuinfo(&content)
        .with_context(|| format!("No x86 identification in {}", cpuinfo_path.display()))?;
    let cpuid = identity.cpuid_str();
    info!("CPU id: {cpuid}");
    Ok(cpuid)
}

/// A full id carries all of vendor, family, model and stepping
pub fn is_full_cpuid(id: &str) -> bool {
    id.matches('-').count() == 3
}

/// Table ids are prefixes: `GenuineIntel-6-5E` matches every stepping of that model
pub fn cpuid_matches(pattern: &str, cpuid: &str) -> bool {
    if !is_full_cpuid(cpuid) {
        debug!("Invalid CPUID {cpuid}, full vendor-family-model-stepping is required");
        return false;
    }
    cpuid.starts_with(pattern)
}
