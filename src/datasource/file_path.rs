// Thread names
pub const MAIN_THREAD: &str = "Exporter";
pub const FREQ_WRITER_THREAD: &str = "FreqWriter";
pub const TICKER_THREAD: &str = "UpdateTicker";
pub const LOG_LEVEL_THREAD: &str = "LogLevelWatcher";

// File paths
pub const CONFIG_FILE: &str = "/etc/memgovernor/config.toml";
pub const LOG_LEVEL_PATH: &str = "/etc/memgovernor/log_level";
pub const EXPORT_DIR: &str = "/run/memgovernor";
pub const CPUINFO_PATH: &str = "/proc/cpuinfo";
pub const CPU_SYSFS_ROOT: &str = "/sys/devices/system/cpu";

// Export directory entries
pub const EXPORT_LOG_FILE: &str = "log";
pub const EXPORT_INFO_FILE: &str = "info";

// cpufreq policy nodes, relative to <root>/cpufreq/policyN
pub const CPUFREQ_DIR: &str = "cpufreq";
pub const POLICY_PREFIX: &str = "policy";
pub const RELATED_CPUS: &str = "related_cpus";
pub const AFFECTED_CPUS: &str = "affected_cpus";
pub const CPUINFO_MIN_FREQ: &str = "cpuinfo_min_freq";
pub const CPUINFO_MAX_FREQ: &str = "cpuinfo_max_freq";
pub const CPUINFO_TRANSITION_LATENCY: &str = "cpuinfo_transition_latency";
pub const SCALING_GOVERNOR: &str = "scaling_governor";
pub const SCALING_SETSPEED: &str = "scaling_setspeed";

pub const USERSPACE_GOVERNOR: &str = "userspace";
