use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use log::debug;
use parking_lot::Mutex;

use crate::{
    datasource::{cpufreq::DomainInfo, perf_counter::CounterSource},
    error::{CounterError, GovernorError},
    error_ratelimited,
    model::{
        actuator::{ActuationCounters, ActuationMode, Actuator},
        decision_engine::{CounterBaselines, Heuristic, decide},
        ring_buffer::{LogEntry, TelemetryRingBuffer},
    },
    utils::constants::EVENT_COUNT,
    warn_ratelimited,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    /// Minimum ns between two decisions
    pub update_interval_ns: u64,
    pub heuristic: Heuristic,
}

#[derive(Debug, Default)]
struct PolicyStats {
    decisions: AtomicU64,
    fallbacks: AtomicU64,
    skipped: AtomicU64,
    contended: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyStatsSnapshot {
    /// Heuristic evaluations
    pub decisions: u64,
    /// Windows where a counter read failed and max was requested
    pub fallbacks: u64,
    /// Requests refused before reaching the hardware
    pub skipped: u64,
    /// Updates that found another update in flight
    pub contended: u64,
    pub actuations: u64,
    pub actuation_failures: u64,
}

/// What a single update event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The policy is stopping
    Closed,
    /// Unit does not belong to this domain
    Rejected,
    /// Another update on this domain is running
    Contended,
    /// Inside the rate-limit window
    NotDue,
    /// A frequency was requested
    Requested(u32),
}

struct PolicyState {
    last_applied_freq: u32,
    last_update_time: Option<u64>,
    last_decision_time: Option<u64>,
    baselines: CounterBaselines,
    counters: Box<dyn CounterSource>,
    actuator: Actuator,
}

/// Per-domain controller: rate limit, decision, actuation and logging
pub struct Policy {
    domain: Arc<DomainInfo>,
    settings: PolicySettings,
    accepting: AtomicBool,
    state: Mutex<PolicyState>,
    telemetry: Arc<TelemetryRingBuffer>,
    stats: PolicyStats,
    actuation: Arc<ActuationCounters>,
}

impl Policy {
    pub fn new(
        domain: Arc<DomainInfo>,
        settings: PolicySettings,
        mut counters: Box<dyn CounterSource>,
        actuator: Actuator,
        telemetry: Arc<TelemetryRingBuffer>,
    ) -> Self {
        // first window measures from start, not from boot
        let mut baselines = CounterBaselines::default();
        let failed = Self::failed_baseline_reads(&baselines.sample(counters.as_mut()));
        if !failed.is_empty() {
            debug!(
                "Domain {}: baseline read failed for events {failed:?}, first window measures from zero",
                domain.id
            );
        }

        let actuation = actuator.counters();
        Self {
            settings,
            accepting: AtomicBool::new(true),
            state: Mutex::new(PolicyState {
                last_applied_freq: domain.max_freq,
                last_update_time: None,
                last_decision_time: None,
                baselines,
                counters,
                actuator,
            }),
            domain,
            telemetry,
            stats: PolicyStats::default(),
            actuation,
        }
    }

    fn failed_baseline_reads(samples: &[Result<u64, CounterError>; EVENT_COUNT]) -> Vec<usize> {
        samples
            .iter()
            .enumerate()
            .filter_map(|(index, sample)| sample.is_err().then_some(index))
            .collect()
    }

    pub fn domain(&self) -> &DomainInfo {
        &self.domain
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn telemetry(&self) -> &Arc<TelemetryRingBuffer> {
        &self.telemetry
    }

    pub fn actuation_mode(&self) -> ActuationMode {
        self.state.lock().actuator.mode()
    }

    pub fn last_applied_freq(&self) -> u32 {
        self.state.lock().last_applied_freq
    }

    pub fn last_update_time(&self) -> Option<u64> {
        self.state.lock().last_update_time
    }

    /// When the last request was made, whether or not it reached the hardware
    pub fn last_decision_time(&self) -> Option<u64> {
        self.state.lock().last_decision_time
    }

    fn due(&self, state: &PolicyState, unit: u32, now: u64) -> bool {
        if !self.domain.contains(unit) {
            return false;
        }
        match state.last_update_time {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.settings.update_interval_ns,
        }
    }

    /// Whether an update from `unit` at `now` would re-evaluate the frequency
    pub fn should_update(&self, unit: u32, now: u64) -> bool {
        self.due(&self.state.lock(), unit, now)
    }

    /// Update path entry point. Never blocks on another update.
    pub fn on_update(&self, unit: u32, now: u64) -> UpdateOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            return UpdateOutcome::Closed;
        }
        let Some(mut guard) = self.state.try_lock() else {
            self.stats.contended.fetch_add(1, Ordering::Relaxed);
            return UpdateOutcome::Contended;
        };
        // stop may have closed admission while we waited for the lock
        if !self.accepting.load(Ordering::Acquire) {
            return UpdateOutcome::Closed;
        }
        if !self.domain.contains(unit) {
            return UpdateOutcome::Rejected;
        }
        if !self.due(&guard, unit, now) {
            return UpdateOutcome::NotDue;
        }

        let state = &mut *guard;
        let samples = state.baselines.sample(state.counters.as_mut());

        let mut deltas = [None; EVENT_COUNT];
        let mut perf_values = [0u64; EVENT_COUNT];
        let mut read_failed = false;
        for (index, sample) in samples.into_iter().enumerate() {
            match sample {
                Ok(delta) => {
                    deltas[index] = Some(delta);
                    perf_values[index] = delta;
                }
                Err(source) => {
                    read_failed = true;
                    let e = GovernorError::CounterReadTransient { index, source };
                    warn_ratelimited!("Domain {}: {e}", self.domain.id);
                }
            }
        }

        let freq = if read_failed {
            self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
            self.domain.max_freq
        } else {
            self.stats.decisions.fetch_add(1, Ordering::Relaxed);
            decide(
                &deltas,
                self.domain.bounds(),
                state.last_applied_freq,
                &self.settings.heuristic,
            )
        };

        self.apply(state, freq, now);

        self.telemetry.append(LogEntry {
            timestamp: now,
            perf_values,
            requested_freq: freq,
            unit_id: self.domain.id,
        });
        state.last_update_time = Some(now);

        UpdateOutcome::Requested(freq)
    }

    /// Records the request before dispatch so logging and rate limiting follow
    /// what was asked for, not what landed
    fn apply(&self, state: &mut PolicyState, freq: u32, now: u64) {
        state.last_applied_freq = freq;
        state.last_decision_time = Some(now);

        match state.actuator.dispatch(freq) {
            Ok(()) => {}
            Err(e @ GovernorError::SharedDomainUnsupported { .. }) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                error_ratelimited!("{e}, skipping {freq}KHz");
            }
            Err(e) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                warn_ratelimited!("Domain {}: {e}", self.domain.id);
            }
        }
    }

    /// Closes admission and waits for an in-flight update to leave
    pub fn quiesce(&self) {
        self.accepting.store(false, Ordering::Release);
        drop(self.state.lock());
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Cancels a pending deferred request and joins the writer
    pub fn shutdown_actuator(&self) {
        self.state.lock().actuator.shutdown();
    }

    pub fn stats(&self) -> PolicyStatsSnapshot {
        PolicyStatsSnapshot {
            decisions: self.stats.decisions.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            contended: self.stats.contended.load(Ordering::Relaxed),
            actuations: self.actuation.actuations.load(Ordering::Relaxed),
            actuation_failures: self.actuation.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        datasource::cpufreq::FrequencyDriver,
        error::GovernorResult,
        model::decision_engine::HeuristicKind,
    };

    /// Replays queued absolute values per event; an empty queue repeats the last one
    struct ScriptedCounters {
        values: [VecDeque<Result<u64, CounterError>>; EVENT_COUNT],
        last: [u64; EVENT_COUNT],
    }

    impl ScriptedCounters {
        fn new() -> Self {
            Self {
                values: Default::default(),
                last: [0; EVENT_COUNT],
            }
        }

        fn push(mut self, window: [Result<u64, CounterError>; EVENT_COUNT]) -> Self {
            for (queue, value) in self.values.iter_mut().zip(window) {
                queue.push_back(value);
            }
            self
        }
    }

    impl CounterSource for ScriptedCounters {
        fn read(&mut self, index: usize) -> Result<u64, CounterError> {
            match self.values[index].pop_front() {
                Some(Ok(value)) => {
                    self.last[index] = value;
                    Ok(value)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last[index]),
            }
        }

        fn event_count(&self) -> usize {
            EVENT_COUNT
        }
    }

    #[derive(Default)]
    struct FastDriver {
        switched: Mutex<Vec<u32>>,
    }

    impl FrequencyDriver for FastDriver {
        fn domains(&self) -> anyhow::Result<Vec<DomainInfo>> {
            Ok(Vec::new())
        }
        fn acquire(&self, _: &DomainInfo) -> GovernorResult<()> {
            Ok(())
        }
        fn release(&self, _: &DomainInfo) {}
        fn fast_switch(&self, _: &DomainInfo, freq: u32) -> GovernorResult<()> {
            self.switched.lock().push(freq);
            Ok(())
        }
        fn blocking_switch(&self, _: &DomainInfo, _: u32) -> GovernorResult<()> {
            unreachable!("fast switch domain")
        }
    }

    fn domain(cpus: Vec<u32>) -> Arc<DomainInfo> {
        Arc::new(DomainInfo {
            id: 3,
            cpus,
            min_freq: 800,
            max_freq: 3000,
            transition_delay_ns: 0,
            fast_switch: true,
        })
    }

    fn policy(domain: Arc<DomainInfo>, counters: ScriptedCounters) -> (Policy, Arc<FastDriver>) {
        let driver = Arc::new(FastDriver::default());
        let actuator = Actuator::new(Arc::clone(&domain), driver.clone()).unwrap();
        let settings = PolicySettings {
            update_interval_ns: 1_000_000,
            heuristic: Heuristic::new(HeuristicKind::StallRatio, 10, 65).unwrap(),
        };
        let ring = Arc::new(TelemetryRingBuffer::new(16).unwrap());
        (Policy::new(domain, settings, Box::new(counters), actuator, ring), driver)
    }

    #[test]
    fn rate_limit_gates_decisions() {
        let counters = ScriptedCounters::new()
            .push([Ok(0), Ok(0), Ok(0)])
            .push([Ok(100), Ok(1000), Ok(100)])
            .push([Ok(200), Ok(2000), Ok(750)]);
        let (policy, driver) = policy(domain(vec![3]), counters);

        assert!(matches!(policy.on_update(3, 0), UpdateOutcome::Requested(_)));
        assert_eq!(policy.on_update(3, 500_000), UpdateOutcome::NotDue);
        assert_eq!(policy.stats().decisions, 1);

        assert!(matches!(policy.on_update(3, 1_000_001), UpdateOutcome::Requested(_)));
        assert_eq!(policy.stats().decisions, 2);
        assert_eq!(driver.switched.lock().len(), 2);
        assert_eq!(policy.last_update_time(), Some(1_000_001));
    }

    #[test]
    fn foreign_unit_is_rejected_without_side_effects() {
        let (policy, driver) = policy(domain(vec![3]), ScriptedCounters::new());
        assert!(!policy.should_update(5, 0));
        assert_eq!(policy.on_update(5, 0), UpdateOutcome::Rejected);
        assert_eq!(policy.last_update_time(), None);
        assert!(driver.switched.lock().is_empty());
        assert!(policy.telemetry().is_empty());
    }

    #[test]
    fn read_failure_falls_back_to_max_and_still_logs() {
        let counters = ScriptedCounters::new()
            .push([Ok(0), Ok(0), Ok(0)])
            .push([Ok(100), Err(CounterError::TransientReadFailure), Ok(600)]);
        let (policy, driver) = policy(domain(vec![3]), counters);

        assert_eq!(policy.on_update(3, 10), UpdateOutcome::Requested(3000));
        assert_eq!(policy.stats().fallbacks, 1);
        assert_eq!(policy.stats().decisions, 0);
        assert_eq!(*driver.switched.lock(), vec![3000]);

        let snapshot = policy.telemetry().snapshot_and_clear();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].perf_values, [100, 0, 600]);
        assert_eq!(snapshot.entries[0].requested_freq, 3000);
        assert_eq!(snapshot.entries[0].unit_id, 3);
    }

    #[test]
    fn logs_deltas_and_requested_frequency() {
        let counters = ScriptedCounters::new()
            .push([Ok(1_000), Ok(10_000), Ok(5_000)])
            .push([Ok(1_100), Ok(11_000), Ok(5_650)]);
        let (policy, _) = policy(domain(vec![3]), counters);

        // stall ratio 65 maps to min under the inverse default
        assert_eq!(policy.on_update(3, 42), UpdateOutcome::Requested(800));
        assert_eq!(policy.last_applied_freq(), 800);

        let entry = policy.telemetry().snapshot_and_clear().entries[0];
        assert_eq!(entry.timestamp, 42);
        assert_eq!(entry.perf_values, [100, 1000, 650]);
        assert_eq!(entry.requested_freq, 800);
    }

    #[test]
    fn shared_domain_records_request_but_skips_actuation() {
        let counters = ScriptedCounters::new()
            .push([Ok(0), Ok(0), Ok(0)])
            .push([Ok(0), Ok(1000), Ok(100)]);
        let (policy, driver) = policy(domain(vec![2, 3]), counters);

        assert_eq!(policy.on_update(2, 0), UpdateOutcome::Requested(3000));
        assert_eq!(policy.last_applied_freq(), 3000);
        assert_eq!(policy.stats().skipped, 1);
        assert!(driver.switched.lock().is_empty());
        assert_eq!(policy.telemetry().len(), 1);
    }

    #[test]
    fn failed_baseline_read_measures_first_window_from_zero() {
        let counters = ScriptedCounters::new()
            .push([Ok(50), Err(CounterError::Unsupported), Ok(50)])
            .push([Ok(150), Ok(1000), Ok(700)]);
        let (policy, _) = policy(domain(vec![3]), counters);

        assert_eq!(policy.on_update(3, 0), UpdateOutcome::Requested(800));
        let entry = policy.telemetry().snapshot_and_clear().entries[0];
        assert_eq!(entry.perf_values, [100, 1000, 650]);
        assert_eq!(
            Policy::failed_baseline_reads(&[Ok(1), Err(CounterError::Unsupported), Ok(2)]),
            vec![1]
        );
    }

    #[test]
    fn quiesced_policy_admits_nothing() {
        let (policy, driver) = policy(domain(vec![3]), ScriptedCounters::new());
        policy.quiesce();
        assert!(!policy.is_accepting());
        assert_eq!(policy.on_update(3, 0), UpdateOutcome::Closed);
        assert!(driver.switched.lock().is_empty());
    }

    #[test]
    fn contended_update_is_counted_not_blocked() {
        let (policy, _) = policy(domain(vec![3]), ScriptedCounters::new());
        let guard = policy.state.lock();
        assert_eq!(policy.on_update(3, 0), UpdateOutcome::Contended);
        drop(guard);
        assert_eq!(policy.stats().contended, 1);
    }
}
