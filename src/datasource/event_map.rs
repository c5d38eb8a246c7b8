use log::{debug, info, warn};

use crate::{
    datasource::cpuid::cpuid_matches,
    error::{GovernorError, GovernorResult, ResolveError},
    utils::constants::EVENT_COUNT,
};

const PARSE_EVENT_MAX_PAIRS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Hardware,
    Software,
    HwCache,
    /// Model-specific encoding for the core PMU
    Raw,
}

impl EventKind {
    /// `perf_event_attr.type`
    pub fn perf_type(self) -> u32 {
        match self {
            EventKind::Hardware => 0,
            EventKind::Software => 1,
            EventKind::HwCache => 3,
            EventKind::Raw => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    pub name: String,
    pub kind: EventKind,
    pub config: u64,
    pub period: u64,
}

// generic hardware ids
const HW_CPU_CYCLES: u64 = 0;
const HW_INSTRUCTIONS: u64 = 1;
const HW_CACHE_REFERENCES: u64 = 2;
const HW_CACHE_MISSES: u64 = 3;
const HW_BRANCH_INSTRUCTIONS: u64 = 4;
const HW_BRANCH_MISSES: u64 = 5;
const HW_BUS_CYCLES: u64 = 6;
const HW_STALLED_CYCLES_FRONTEND: u64 = 7;
const HW_STALLED_CYCLES_BACKEND: u64 = 8;
const HW_REF_CPU_CYCLES: u64 = 9;
const SW_CPU_CLOCK: u64 = 0;

const fn hw_cache(cache: u64, op: u64, result: u64) -> u64 {
    cache | (op << 8) | (result << 16)
}

const CACHE_L1D: u64 = 0;
const CACHE_L1I: u64 = 1;
const CACHE_LL: u64 = 2;
const OP_READ: u64 = 0;
const OP_WRITE: u64 = 1;
const RESULT_ACCESS: u64 = 0;
const RESULT_MISS: u64 = 1;

/// Events every perf-capable kernel understands, independent of the CPU model
pub const PORTABLE_EVENTS: &[(&str, EventKind, u64)] = &[
    ("cycles", EventKind::Hardware, HW_CPU_CYCLES),
    ("instructions", EventKind::Hardware, HW_INSTRUCTIONS),
    ("cache-references", EventKind::Hardware, HW_CACHE_REFERENCES),
    ("cache-misses", EventKind::Hardware, HW_CACHE_MISSES),
    ("branch-instructions", EventKind::Hardware, HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", EventKind::Hardware, HW_BRANCH_MISSES),
    ("bus-cycles", EventKind::Hardware, HW_BUS_CYCLES),
    ("stalled-cycles-frontend", EventKind::Hardware, HW_STALLED_CYCLES_FRONTEND),
    ("stalled-cycles-backend", EventKind::Hardware, HW_STALLED_CYCLES_BACKEND),
    ("ref-cycles", EventKind::Hardware, HW_REF_CPU_CYCLES),
    ("cpu-clock", EventKind::Software, SW_CPU_CLOCK),
    ("l1d-read", EventKind::HwCache, hw_cache(CACHE_L1D, OP_READ, RESULT_ACCESS)),
    ("l1d-read-miss", EventKind::HwCache, hw_cache(CACHE_L1D, OP_READ, RESULT_MISS)),
    ("l1d-write", EventKind::HwCache, hw_cache(CACHE_L1D, OP_WRITE, RESULT_ACCESS)),
    ("l1d-write-miss", EventKind::HwCache, hw_cache(CACHE_L1D, OP_WRITE, RESULT_MISS)),
    ("l1i-read", EventKind::HwCache, hw_cache(CACHE_L1I, OP_READ, RESULT_ACCESS)),
    ("l1i-read-miss", EventKind::HwCache, hw_cache(CACHE_L1I, OP_READ, RESULT_MISS)),
    ("l1i-write", EventKind::HwCache, hw_cache(CACHE_L1I, OP_WRITE, RESULT_ACCESS)),
    ("l1i-write-miss", EventKind::HwCache, hw_cache(CACHE_L1I, OP_WRITE, RESULT_MISS)),
    ("ll-read", EventKind::HwCache, hw_cache(CACHE_LL, OP_READ, RESULT_ACCESS)),
    ("ll-read-miss", EventKind::HwCache, hw_cache(CACHE_LL, OP_READ, RESULT_MISS)),
    ("ll-write", EventKind::HwCache, hw_cache(CACHE_LL, OP_WRITE, RESULT_ACCESS)),
    ("ll-write-miss", EventKind::HwCache, hw_cache(CACHE_LL, OP_WRITE, RESULT_MISS)),
];

/// Model-specific events for one CPU id prefix
pub struct PmuEventsMap {
    pub cpuid: &'static str,
    pub events: &'static [(&'static str, &'static str)],
}

// Skylake/Kaby Lake/Coffee Lake client cores share these encodings
const SKYLAKE_EVENTS: &[(&str, &str)] = &[
    ("inst_retired.any", "event=0xc0,period=2000003"),
    ("cpu_clk_unhalted.thread", "event=0x3c,period=2000003"),
    ("cycle_activity.stalls_total", "event=0xa3,umask=0x4,cmask=4,period=2000003"),
    ("cycle_activity.stalls_l2_miss", "event=0xa3,umask=0x5,cmask=5,period=2000003"),
    ("cycle_activity.stalls_l3_miss", "event=0xa3,umask=0x6,cmask=6,period=2000003"),
    ("cycle_activity.stalls_mem_any", "event=0xa3,umask=0x14,cmask=20,period=2000003"),
];

pub const PMU_EVENTS_MAP: &[PmuEventsMap] = &[
    PmuEventsMap {
        cpuid: "GenuineIntel-6-4E",
        events: SKYLAKE_EVENTS,
    },
    PmuEventsMap {
        cpuid: "GenuineIntel-6-5E",
        events: SKYLAKE_EVENTS,
    },
    PmuEventsMap {
        cpuid: "GenuineIntel-6-8E",
        events: SKYLAKE_EVENTS,
    },
    PmuEventsMap {
        cpuid: "GenuineIntel-6-9E",
        events: SKYLAKE_EVENTS,
    },
];

/// Parses a C integer literal: `0x` hex, leading `0` octal, else decimal
fn parse_c_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if value.len() > 1 && value.starts_with('0') {
        u64::from_str_radix(&value[1..], 8).ok()
    } else {
        value.parse().ok()
    }
}

/// Packs a `key=value,...` encoding into a raw core PMU config and its period
pub fn parse_event(encoding: &str) -> Result<(u64, u64), ResolveError> {
    let malformed = |reason: String| ResolveError::Malformed {
        encoding: encoding.to_string(),
        reason,
    };

    let pairs: Vec<&str> = encoding.split(',').collect();
    if pairs.len() > PARSE_EVENT_MAX_PAIRS {
        return Err(malformed(format!(
            "more than {PARSE_EVENT_MAX_PAIRS} key=value pairs"
        )));
    }

    let mut config = 0u64;
    let mut period = 0u64;
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| malformed(format!("\"{pair}\" is not key=value")))?;
        let value = parse_c_u64(value)
            .ok_or_else(|| malformed(format!("bad number \"{value}\" for {key}")))?;

        match key.trim() {
            "event" => config |= value & 0xFF,
            "umask" => config |= (value & 0xFF) << 8,
            "cmask" => config |= (value & 0xFF) << 24,
            "edge" => config |= (value & 1) << 18,
            "inv" => config |= (value & 1) << 23,
            "any" => {
                warn!("Event encoding uses the any-thread bit: {encoding}");
                config |= (value & 1) << 21;
            }
            "period" => period = value,
            other => return Err(malformed(format!("unknown key \"{other}\""))),
        }
    }

    Ok((config, period))
}

/// Turns symbolic event names into descriptors for the running CPU model
pub struct EventResolver {
    cpuid: Option<String>,
    table: Option<&'static PmuEventsMap>,
}

impl EventResolver {
    pub fn for_cpuid(cpuid: &str) -> Self {
        let table = PMU_EVENTS_MAP
            .iter()
            .find(|map| cpuid_matches(map.cpuid, cpuid));
        match table {
            Some(map) => info!("Found PMU events table \"{}\" for CPUID=\"{cpuid}\"", map.cpuid),
            None => warn!("Did not find PMU events table for CPUID=\"{cpuid}\", portable events only"),
        }
        Self {
            cpuid: Some(cpuid.to_string()),
            table,
        }
    }

    pub fn portable_only() -> Self {
        Self {
            cpuid: None,
            table: None,
        }
    }

    pub fn has_model_table(&self) -> bool {
        self.table.is_some()
    }

    pub fn resolve(&self, name: &str) -> Result<EventDescriptor, ResolveError> {
        if let Some(&(_, kind, config)) = PORTABLE_EVENTS.iter().find(|(n, ..)| *n == name) {
            debug!("{name} is a portable event");
            return Ok(EventDescriptor {
                name: name.to_string(),
                kind,
                config,
                period: 0,
            });
        }

        let table = self.table.ok_or(ResolveError::NoEventTable)?;
        let (_, encoding) = table
            .events
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| ResolveError::NotFound {
                cpuid: self.cpuid.clone().unwrap_or_default(),
            })?;

        let (config, period) = parse_event(encoding)?;
        debug!("{name} resolved to config={config:#x} period={period}");
        Ok(EventDescriptor {
            name: name.to_string(),
            kind: EventKind::Raw,
            config,
            period,
        })
    }

    /// Resolves every configured event; the first failure aborts a domain start
    pub fn resolve_all(
        &self,
        names: &[String; EVENT_COUNT],
    ) -> GovernorResult<[EventDescriptor; EVENT_COUNT]> {
        let mut resolved = Vec::with_capacity(EVENT_COUNT);
        for (index, name) in names.iter().enumerate() {
            let descriptor =
                self.resolve(name)
                    .map_err(|e| GovernorError::CounterUnavailable {
                        index,
                        name: name.clone(),
                        reason: e.to_string(),
                    })?;
            resolved.push(descriptor);
        }
        resolved
            .try_into()
            .map_err(|_| GovernorError::InvalidConfig("event count mismatch".into()))
    }
}
