/// Memory-stall governor constants
/// Defaults shared by the config parser, the engine and the daemon
pub const NOTES: &str = "Memory-Stall CPU Frequency Governor";
pub const VERSION: &str = "Version: v0.3.0";

/// Number of perf events feeding every decision
pub const EVENT_COUNT: usize = 3;

/// Heuristic and rate-limit defaults
pub mod strategy {
    pub const UPDATE_INTERVAL_FLOOR_NS: u64 = 5_000_000;
    pub const HEURISTIC_LO_THRESHOLD: u64 = 10;
    pub const HEURISTIC_HI_THRESHOLD: u64 = 65;
    pub const DEFAULT_EVENT_NAMES: [&str; super::EVENT_COUNT] = [
        "inst_retired.any",
        "cpu_clk_unhalted.thread",
        "cycle_activity.stalls_l2_miss",
    ];
}

/// Telemetry and export defaults
pub mod telemetry {
    pub const RING_BUFFER_CAPACITY: usize = 2000;
    // 2000 entries * ~130 bytes * 8 units
    pub const LOG_CAPACITY_BYTES: usize = 2_000_000;
    pub const EXPORT_INTERVAL_MS: u64 = 1000;
    pub const EXPORT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
}

/// cpufreq transition delay derivation
pub mod cpufreq {
    pub const LATENCY_MULTIPLIER: u64 = 1000;
    pub const MAX_TRANSITION_DELAY_US: u64 = 10_000;
    pub const NSEC_PER_USEC: u64 = 1000;
    pub const NSEC_PER_MSEC: u64 = 1_000_000;
}
