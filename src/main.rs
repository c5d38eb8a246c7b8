use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};

use memgovernor::{
    datasource::{
        config_parser::config_read,
        cpufreq::SysfsCpufreq,
        cpuid::read_cpuid,
        event_map::EventResolver,
        file_path::*,
        perf_counter::PerfCounterProvider,
        update_hook::TickerHost,
    },
    model::governor::Governor,
    utils::{
        constants::{NOTES, VERSION},
        log_monitor::monitor_log_level,
        logger::init_logger,
    },
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// wake up this often while waiting for the next export
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "memgovernor", version, about = NOTES)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Directory receiving the info and log files
    #[arg(short, long)]
    export_dir: Option<PathBuf>,

    /// Period of the built-in update ticker in microseconds
    #[arg(long, default_value_t = 1000)]
    tick_us: u64,

    /// Only control domains containing these units
    #[arg(long, value_delimiter = ',')]
    cpus: Vec<u32>,

    /// Runtime log level file (debug|info|warn|error)
    #[arg(long, default_value = LOG_LEVEL_PATH)]
    log_level: PathBuf,
}

fn build_resolver() -> EventResolver {
    match read_cpuid(CPUINFO_PATH) {
        Ok(cpuid) => EventResolver::for_cpuid(&cpuid),
        Err(e) => {
            warn!("Failed to read CPUID: {e:#}, portable events only");
            EventResolver::portable_only()
        }
    }
}

fn start_domains(governor: &Governor, cpus: &[u32]) -> usize {
    if cpus.is_empty() {
        return governor.start_all().len();
    }

    let mut started = 0;
    for id in governor.domain_ids() {
        let Some(info) = governor.domain_info(id) else {
            continue;
        };
        if !cpus.iter().any(|&unit| info.contains(unit)) {
            info!("Domain {id} not selected, skipping");
            continue;
        }
        if governor.start(id).is_ok() {
            started += 1;
        }
    }
    started
}

fn wait_for_shutdown(period: Duration) -> bool {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        if SHUTDOWN.load(Ordering::Relaxed) {
            return true;
        }
        thread::sleep(SHUTDOWN_POLL.min(period));
    }
    SHUTDOWN.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logger(&cli.log_level)?;

    info!("{NOTES}");
    info!("{VERSION}");

    ctrlc::set_handler(|| {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })
    .context("Failed to install signal handler")?;

    let config_file = cli.config.to_string_lossy().into_owned();
    info!("Reading config file: {config_file}");
    let mut config = config_read(&config_file)?;
    if let Some(dir) = cli.export_dir {
        config.export_dir = Some(dir);
    } else if config.export_dir.is_none() {
        config.export_dir = Some(PathBuf::from(EXPORT_DIR));
    }
    let export_interval = Duration::from_millis(config.export_interval_ms);

    let governor = Governor::new(
        config,
        Arc::new(SysfsCpufreq::new(CPU_SYSFS_ROOT)),
        Arc::new(PerfCounterProvider),
        Arc::new(TickerHost::new(Duration::from_micros(cli.tick_us))),
        build_resolver(),
    )?;

    let started = start_domains(&governor, &cli.cpus);
    if started == 0 {
        error!("No domain could be started");
        return Err(anyhow::anyhow!("No domain could be started"));
    }

    let level_path = cli.log_level.clone();
    thread::Builder::new()
        .name(LOG_LEVEL_THREAD.to_string())
        .spawn(move || {
            if let Err(e) = monitor_log_level(&level_path) {
                error!("Log level monitor error: {e}");
            }
        })
        .context("Failed to spawn log level monitor")?;

    info!("{MAIN_THREAD} Start");
    if let Some(dir) = &governor.config().export_dir {
        info!("Exporting to {} every {}ms", dir.display(), export_interval.as_millis());
    }

    while !wait_for_shutdown(export_interval) {
        let collected = governor.collect_all();
        match governor.flush() {
            Ok(bytes) => debug!("Exported {collected} entries, {bytes} bytes"),
            Err(e) => warn!("Export failed: {e:#}"),
        }
    }

    info!("Shutting down");
    governor.stop_all();
    info!("{MAIN_THREAD} Exit");
    Ok(())
}
