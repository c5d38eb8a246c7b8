use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use anyhow::Result;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    datasource::{
        config_parser::Config,
        cpufreq::{DomainInfo, FrequencyDriver},
        event_map::EventResolver,
        perf_counter::CounterProvider,
        update_hook::{UpdateCallback, UpdateHookHost},
    },
    error::{GovernorError, GovernorResult},
    model::{
        actuator::Actuator,
        decision_engine::Heuristic,
        export::{ExportSink, InfoFile, format_snapshot},
        policy::{Policy, PolicySettings, PolicyStatsSnapshot, UpdateOutcome},
        ring_buffer::TelemetryRingBuffer,
    },
    utils::constants::cpufreq::NSEC_PER_MSEC,
};

/// Control of a domain's frequency, given back on drop
struct DriverClaim {
    driver: Arc<dyn FrequencyDriver>,
    domain: Arc<DomainInfo>,
}

impl DriverClaim {
    fn acquire(driver: &Arc<dyn FrequencyDriver>, domain: &Arc<DomainInfo>) -> GovernorResult<Self> {
        driver.acquire(domain)?;
        Ok(Self {
            driver: Arc::clone(driver),
            domain: Arc::clone(domain),
        })
    }
}

impl Drop for DriverClaim {
    fn drop(&mut self) {
        self.driver.release(&self.domain);
    }
}

/// Update hooks of every unit in a domain, deregistered in reverse on drop
struct HookRegistration {
    host: Arc<dyn UpdateHookHost>,
    units: Vec<u32>,
}

impl HookRegistration {
    fn register(
        host: &Arc<dyn UpdateHookHost>,
        units: &[u32],
        policy: &Arc<Policy>,
    ) -> GovernorResult<Self> {
        let mut registration = Self {
            host: Arc::clone(host),
            units: Vec::with_capacity(units.len()),
        };
        for &unit in units {
            let weak = Arc::downgrade(policy);
            let callback: UpdateCallback = Arc::new(move |unit, now| {
                if let Some(policy) = weak.upgrade() {
                    policy.on_update(unit, now);
                }
            });
            // units registered so far are released when `registration` drops
            host.register_update_hook(unit, callback)?;
            registration.units.push(unit);
        }
        Ok(registration)
    }
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        for &unit in self.units.iter().rev() {
            self.host.deregister_update_hook(unit);
        }
    }
}

/// Everything a started domain holds; torn down in stop order on drop
struct StartedDomain {
    hooks: Option<HookRegistration>,
    policy: Arc<Policy>,
    sink: Arc<ExportSink>,
    claim: Option<DriverClaim>,
}

impl StartedDomain {
    fn teardown(&mut self) {
        let id = self.policy.domain().id;
        drop(self.hooks.take());
        self.policy.quiesce();
        self.policy.shutdown_actuator();
        let collected = self.sink.collect(self.policy.telemetry());
        drop(self.claim.take());
        info!("Domain {id} stopped, {collected} entries collected");
    }
}

impl Drop for StartedDomain {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct DomainEntry {
    info: Arc<DomainInfo>,
    started: Option<StartedDomain>,
}

/// Multi-domain controller owning every policy and the shared export sink
pub struct Governor {
    config: Config,
    heuristic: Heuristic,
    driver: Arc<dyn FrequencyDriver>,
    counters: Arc<dyn CounterProvider>,
    hooks: Arc<dyn UpdateHookHost>,
    resolver: EventResolver,
    core_count: usize,
    domains: Mutex<BTreeMap<u32, DomainEntry>>,
    sink: Mutex<Weak<ExportSink>>,
}

impl Governor {
    pub fn new(
        config: Config,
        driver: Arc<dyn FrequencyDriver>,
        counters: Arc<dyn CounterProvider>,
        hooks: Arc<dyn UpdateHookHost>,
        resolver: EventResolver,
    ) -> Result<Self> {
        config.validate()?;
        let heuristic = config.heuristic()?;

        let domains: BTreeMap<u32, DomainEntry> = driver
            .domains()?
            .into_iter()
            .map(|info| {
                (
                    info.id,
                    DomainEntry {
                        info: Arc::new(info),
                        started: None,
                    },
                )
            })
            .collect();
        let core_count = domains.values().map(|d| d.info.cpus.len()).sum();

        Ok(Self {
            config,
            heuristic,
            driver,
            counters,
            hooks,
            resolver,
            core_count,
            domains: Mutex::new(domains),
            sink: Mutex::new(Weak::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn domain_ids(&self) -> Vec<u32> {
        self.domains.lock().keys().copied().collect()
    }

    pub fn domain_info(&self, domain: u32) -> Option<Arc<DomainInfo>> {
        self.domains.lock().get(&domain).map(|d| Arc::clone(&d.info))
    }

    pub fn is_started(&self, domain: u32) -> bool {
        self.domains
            .lock()
            .get(&domain)
            .is_some_and(|d| d.started.is_some())
    }

    /// The shared sink while at least one domain is started
    pub fn sink(&self) -> Option<Arc<ExportSink>> {
        self.sink.lock().upgrade()
    }

    fn sink_for(&self, update_interval_ns: u64) -> GovernorResult<Arc<ExportSink>> {
        let mut slot = self.sink.lock();
        if let Some(sink) = slot.upgrade() {
            return Ok(sink);
        }
        let info = InfoFile::new(
            self.core_count,
            update_interval_ns,
            self.config.ring_buffer_capacity,
        );
        let sink = Arc::new(ExportSink::create(
            self.config.export_dir.as_deref(),
            self.config.log_capacity_bytes,
            self.config.export_rotate_bytes,
            &info,
        )?);
        *slot = Arc::downgrade(&sink);
        debug!("Export sink created");
        Ok(sink)
    }

    fn start_domain(&self, info: &Arc<DomainInfo>) -> GovernorResult<StartedDomain> {
        let events = self.resolver.resolve_all(&self.config.event_names)?;
        let counters = self.counters.open(info.lead_unit(), &events)?;
        let ring = Arc::new(TelemetryRingBuffer::new(self.config.ring_buffer_capacity)?);

        let update_interval_ns = self.config.update_interval_ns(info.transition_delay_ns);
        let sink = self.sink_for(update_interval_ns)?;
        let claim = DriverClaim::acquire(&self.driver, info)?;
        let actuator = Actuator::new(Arc::clone(info), Arc::clone(&self.driver))?;

        let settings = PolicySettings {
            update_interval_ns,
            heuristic: self.heuristic,
        };
        let policy = Arc::new(Policy::new(Arc::clone(info), settings, counters, actuator, ring));
        let hooks = HookRegistration::register(&self.hooks, &info.cpus, &policy)?;

        let interval_ms = (update_interval_ns / NSEC_PER_MSEC).max(1);
        info!(
            "Domain {}: update interval {interval_ms}ms - ring buffer will be full after {} seconds",
            info.id,
            self.config.ring_buffer_capacity as u64 * interval_ms / 1000
        );
        info!(
            "Domain {}: cpus {:?}, {}KHz..{}KHz, {:?}",
            info.id,
            info.cpus,
            info.min_freq,
            info.max_freq,
            policy.actuation_mode()
        );
        if info.is_shared() {
            warn!(
                "Domain {} spans {} units, frequency changes will be skipped",
                info.id,
                info.cpus.len()
            );
        }

        Ok(StartedDomain {
            hooks: Some(hooks),
            policy,
            sink,
            claim: Some(claim),
        })
    }

    /// Stopped -> Started. On failure every acquired resource is released
    /// and the domain stays stopped.
    pub fn start(&self, domain: u32) -> GovernorResult<()> {
        let mut domains = self.domains.lock();
        let entry = domains
            .get_mut(&domain)
            .ok_or(GovernorError::UnknownDomain(domain))?;
        if entry.started.is_some() {
            return Err(GovernorError::AlreadyStarted(domain));
        }

        match self.start_domain(&entry.info) {
            Ok(started) => {
                entry.started = Some(started);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start domain {domain}: {e}");
                Err(e)
            }
        }
    }

    /// Started -> Stopped
    pub fn stop(&self, domain: u32) -> GovernorResult<()> {
        let started = {
            let mut domains = self.domains.lock();
            let entry = domains
                .get_mut(&domain)
                .ok_or(GovernorError::UnknownDomain(domain))?;
            entry.started.take().ok_or(GovernorError::NotStarted(domain))?
        };
        drop(started);
        Ok(())
    }

    /// Starts every stopped domain; returns the ids that started
    pub fn start_all(&self) -> Vec<u32> {
        let mut started = Vec::new();
        for id in self.domain_ids() {
            if self.is_started(id) {
                continue;
            }
            if self.start(id).is_ok() {
                started.push(id);
            }
        }
        info!("{} of {} domains started", started.len(), self.domain_ids().len());
        started
    }

    pub fn stop_all(&self) {
        let started: Vec<StartedDomain> = self
            .domains
            .lock()
            .values_mut()
            .filter_map(|entry| entry.started.take())
            .collect();
        // reverse start order
        for domain in started.into_iter().rev() {
            drop(domain);
        }
    }

    fn policy_for_unit(&self, unit: u32) -> GovernorResult<Arc<Policy>> {
        let domains = self.domains.lock();
        let entry = domains
            .values()
            .find(|entry| entry.info.contains(unit))
            .ok_or(GovernorError::UnknownDomain(unit))?;
        entry
            .started
            .as_ref()
            .map(|started| Arc::clone(&started.policy))
            .ok_or(GovernorError::NotStarted(entry.info.id))
    }

    fn policy(&self, domain: u32) -> GovernorResult<Arc<Policy>> {
        let domains = self.domains.lock();
        let entry = domains
            .get(&domain)
            .ok_or(GovernorError::UnknownDomain(domain))?;
        entry
            .started
            .as_ref()
            .map(|started| Arc::clone(&started.policy))
            .ok_or(GovernorError::NotStarted(domain))
    }

    /// Routes an update event to the domain that owns `unit`
    pub fn on_update(&self, unit: u32, now: u64) -> GovernorResult<UpdateOutcome> {
        Ok(self.policy_for_unit(unit)?.on_update(unit, now))
    }

    /// Drains the ring buffer of the domain owning `unit` into text lines
    pub fn export_log(&self, unit: u32) -> GovernorResult<Vec<String>> {
        let policy = self.policy_for_unit(unit)?;
        let snapshot = policy.telemetry().snapshot_and_clear();
        Ok(format_snapshot(&snapshot))
    }

    /// Drains every started domain into the sink; returns the entry count
    pub fn collect_all(&self) -> usize {
        let Some(sink) = self.sink() else {
            return 0;
        };
        let policies: Vec<Arc<Policy>> = self
            .domains
            .lock()
            .values()
            .filter_map(|entry| entry.started.as_ref().map(|s| Arc::clone(&s.policy)))
            .collect();
        policies
            .iter()
            .map(|policy| sink.collect(policy.telemetry()))
            .sum()
    }

    /// Writes collected text to the export directory
    pub fn flush(&self) -> Result<usize> {
        match self.sink() {
            Some(sink) => sink.flush(),
            None => Ok(0),
        }
    }

    pub fn stats(&self, domain: u32) -> GovernorResult<PolicyStatsSnapshot> {
        Ok(self.policy(domain)?.stats())
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
