pub mod config_parser;
pub mod cpufreq;
pub mod cpuid;
pub mod event_map;
pub mod file_path;
pub mod perf_counter;
pub mod update_hook;
