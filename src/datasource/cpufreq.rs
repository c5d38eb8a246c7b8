use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    datasource::file_path::*,
    error::{GovernorError, GovernorResult},
    model::{actuator::ActuationMode, decision_engine::FreqBounds},
    utils::{
        constants::cpufreq::{LATENCY_MULTIPLIER, MAX_TRANSITION_DELAY_US, NSEC_PER_USEC},
        file_operate::{read_file, read_u64, read_unit_list, write_existing, write_file},
    },
};

/// One frequency domain as the driver reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: u32,
    pub cpus: Vec<u32>,
    pub min_freq: u32,
    pub max_freq: u32,
    pub transition_delay_ns: u64,
    pub fast_switch: bool,
}

impl DomainInfo {
    /// More than one unit shares this clock
    pub fn is_shared(&self) -> bool {
        self.cpus.len() > 1
    }

    pub fn contains(&self, unit: u32) -> bool {
        self.cpus.contains(&unit)
    }

    /// Counters are bound to this unit
    pub fn lead_unit(&self) -> u32 {
        self.cpus.first().copied().unwrap_or(self.id)
    }

    pub fn bounds(&self) -> FreqBounds {
        FreqBounds {
            min: self.min_freq,
            max: self.max_freq,
        }
    }

    pub fn actuation_mode(&self) -> ActuationMode {
        if self.fast_switch {
            ActuationMode::FastSwitch
        } else {
            ActuationMode::Deferred
        }
    }
}

/// Hardware side of frequency changes
pub trait FrequencyDriver: Send + Sync {
    fn domains(&self) -> Result<Vec<DomainInfo>>;

    /// Takes control of the domain's frequency away from the previous owner
    fn acquire(&self, domain: &DomainInfo) -> GovernorResult<()>;

    /// Gives control back; never fails, errors are logged
    fn release(&self, domain: &DomainInfo);

    /// Synchronous change that must not sleep
    fn fast_switch(&self, domain: &DomainInfo, freq: u32) -> GovernorResult<()>;

    /// Change that may sleep, only called from the frequency writer thread
    fn blocking_switch(&self, domain: &DomainInfo, freq: u32) -> GovernorResult<()>;
}

/// cpufreq transition delay: latency scaled by 1000 and capped at 10 ms,
/// 1 ms when the hardware does not report a latency
pub fn transition_delay_ns(latency_ns: u64) -> u64 {
    let latency_us = latency_ns / NSEC_PER_USEC;
    let delay_us = if latency_us > 0 {
        (latency_us * LATENCY_MULTIPLIER).min(MAX_TRANSITION_DELAY_US)
    } else {
        LATENCY_MULTIPLIER
    };
    delay_us * NSEC_PER_USEC
}

/// cpufreq through sysfs, driving `scaling_setspeed` of the userspace governor
pub struct SysfsCpufreq {
    root: PathBuf,
    previous_governors: Mutex<HashMap<u32, String>>,
}

impl SysfsCpufreq {
    /// `root` is the cpu directory, normally `/sys/devices/system/cpu`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            previous_governors: Mutex::new(HashMap::new()),
        }
    }

    fn policy_dir(&self, id: u32) -> PathBuf {
        self.root
            .join(CPUFREQ_DIR)
            .join(format!("{POLICY_PREFIX}{id}"))
    }

    fn read_domain(&self, id: u32, dir: &Path) -> Result<DomainInfo> {
        let cpus = read_unit_list(dir.join(RELATED_CPUS))
            .or_else(|_| read_unit_list(dir.join(AFFECTED_CPUS)))?;
        let min_freq = read_u64(dir.join(CPUINFO_MIN_FREQ))? as u32;
        let max_freq = read_u64(dir.join(CPUINFO_MAX_FREQ))? as u32;
        let latency_ns = read_u64(dir.join(CPUINFO_TRANSITION_LATENCY)).unwrap_or(0);

        if min_freq > max_freq {
            anyhow::bail!("policy{id}: min freq {min_freq} above max freq {max_freq}");
        }

        Ok(DomainInfo {
            id,
            cpus,
            min_freq,
            max_freq,
            transition_delay_ns: transition_delay_ns(latency_ns),
            fast_switch: false,
        })
    }

    fn driver_error(domain: &DomainInfo, e: anyhow::Error) -> GovernorError {
        GovernorError::Driver {
            domain: domain.id,
            reason: format!("{e:#}"),
        }
    }
}

impl FrequencyDriver for SysfsCpufreq {
    fn domains(&self) -> Result<Vec<DomainInfo>> {
        let cpufreq = self.root.join(CPUFREQ_DIR);
        let entries = fs::read_dir(&cpufreq)
            .with_context(|| format!("Failed to list {}", cpufreq.display()))?;

        let mut domains = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(POLICY_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            match self.read_domain(id, &entry.path()) {
                Ok(domain) => {
                    debug!("{domain:?}");
                    domains.push(domain);
                }
                Err(e) => warn!("Skipping policy{id}: {e:#}"),
            }
        }
        domains.sort_by_key(|d| d.id);

        info!("Found {} cpufreq domains", domains.len());
        Ok(domains)
    }

    fn acquire(&self, domain: &DomainInfo) -> GovernorResult<()> {
        let node = self.policy_dir(domain.id).join(SCALING_GOVERNOR);
        let previous = read_file(&node)
            .map(|s| s.trim().to_string())
            .map_err(|e| Self::driver_error(domain, e))?;

        write_file(&node, USERSPACE_GOVERNOR).map_err(|e| Self::driver_error(domain, e))?;
        info!(
            "Domain {}: scaling governor {previous} -> {USERSPACE_GOVERNOR}",
            domain.id
        );
        self.previous_governors.lock().insert(domain.id, previous);
        Ok(())
    }

    fn release(&self, domain: &DomainInfo) {
        let Some(previous) = self.previous_governors.lock().remove(&domain.id) else {
            return;
        };
        let node = self.policy_dir(domain.id).join(SCALING_GOVERNOR);
        match write_existing(&node, &previous) {
            Ok(_) => info!("Domain {}: scaling governor restored to {previous}", domain.id),
            Err(e) => warn!("Domain {}: failed to restore governor: {e:#}", domain.id),
        }
    }

    fn fast_switch(&self, domain: &DomainInfo, _freq: u32) -> GovernorResult<()> {
        Err(GovernorError::Driver {
            domain: domain.id,
            reason: "sysfs cpufreq cannot switch without sleeping".into(),
        })
    }

    fn blocking_switch(&self, domain: &DomainInfo, freq: u32) -> GovernorResult<()> {
        let node = self.policy_dir(domain.id).join(SCALING_SETSPEED);
        write_file(&node, freq.to_string())
            .map(|_| ())
            .map_err(|e| Self::driver_error(domain, e))
    }
}
