use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
    datasource::{
        cpufreq::{DomainInfo, FrequencyDriver},
        file_path::FREQ_WRITER_THREAD,
    },
    error::{GovernorError, GovernorResult},
    warn_ratelimited,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationMode {
    /// The driver changes frequency synchronously without sleeping
    FastSwitch,
    /// A writer thread performs the change
    Deferred,
}

#[derive(Debug, Default)]
pub struct ActuationCounters {
    /// Hardware changes that completed
    pub actuations: AtomicU64,
    /// Hardware changes the driver rejected
    pub failures: AtomicU64,
}

#[derive(Debug, Default)]
struct MailboxState {
    pending: bool,
    target: u32,
    shutdown: bool,
}

/// Single-slot handoff between the update path and the writer thread.
///
/// A post while a request is already pending only replaces the target, so at
/// most one request is ever outstanding and the writer always sees the latest.
#[derive(Debug, Default)]
pub struct Mailbox {
    state: Mutex<MailboxState>,
    wake: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this call raised the pending flag and woke the writer
    pub fn post(&self, freq: u32) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        state.target = freq;
        if state.pending {
            return false;
        }
        state.pending = true;
        self.wake.notify_one();
        true
    }

    /// Takes the pending request without waiting
    pub fn take(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if !state.pending {
            return None;
        }
        state.pending = false;
        Some(state.target)
    }

    /// Blocks until a request is pending; `None` once the mailbox is closed.
    /// The pending flag is cleared before returning, so a post that lands
    /// while the caller is switching is picked up by the next wait.
    pub fn wait_for_request(&self) -> Option<u32> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if state.pending {
                state.pending = false;
                return Some(state.target);
            }
            self.wake.wait(&mut state);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Cancels any pending request and stops the writer
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.pending {
            debug!("Dropping pending frequency request {}", state.target);
        }
        state.pending = false;
        state.shutdown = true;
        self.wake.notify_all();
    }
}

/// Writer thread for one domain
pub struct DeferredWorker {
    mailbox: Arc<Mailbox>,
    handle: Option<JoinHandle<()>>,
}

impl DeferredWorker {
    pub fn spawn(
        domain: Arc<DomainInfo>,
        driver: Arc<dyn FrequencyDriver>,
        counters: Arc<ActuationCounters>,
    ) -> GovernorResult<Self> {
        let mailbox = Arc::new(Mailbox::new());
        let thread_mailbox = Arc::clone(&mailbox);
        let name = format!("{FREQ_WRITER_THREAD}-{}", domain.id);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::run(&domain, driver.as_ref(), &thread_mailbox, &counters))
            .map_err(|e| GovernorError::AllocationFailure {
                what: "frequency writer thread",
                reason: e.to_string(),
            })?;

        info!("{name} Start");
        Ok(Self {
            mailbox,
            handle: Some(handle),
        })
    }

    fn run(
        domain: &DomainInfo,
        driver: &dyn FrequencyDriver,
        mailbox: &Mailbox,
        counters: &ActuationCounters,
    ) {
        while let Some(freq) = mailbox.wait_for_request() {
            match driver.blocking_switch(domain, freq) {
                Ok(()) => {
                    counters.actuations.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn_ratelimited!("Domain {}: failed to set {freq}KHz: {e}", domain.id);
                }
            }
        }
        debug!("{FREQ_WRITER_THREAD}-{} Exit", domain.id);
    }

    /// See [`Mailbox::post`]
    pub fn request(&self, freq: u32) -> bool {
        self.mailbox.post(freq)
    }

    pub fn is_pending(&self) -> bool {
        self.mailbox.is_pending()
    }

    /// Cancels the pending request and joins the thread
    pub fn shutdown(&mut self) {
        self.mailbox.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Frequency writer thread panicked");
            }
        }
    }
}

impl Drop for DeferredWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies decided frequencies to one domain
pub struct Actuator {
    domain: Arc<DomainInfo>,
    driver: Arc<dyn FrequencyDriver>,
    mode: ActuationMode,
    worker: Option<DeferredWorker>,
    counters: Arc<ActuationCounters>,
}

impl Actuator {
    /// Deferred domains get their writer thread here. Shared domains never
    /// reach the hardware and get none.
    pub fn new(domain: Arc<DomainInfo>, driver: Arc<dyn FrequencyDriver>) -> GovernorResult<Self> {
        let counters = Arc::new(ActuationCounters::default());
        let mode = domain.actuation_mode();
        let worker = match mode {
            ActuationMode::Deferred if !domain.is_shared() => Some(DeferredWorker::spawn(
                Arc::clone(&domain),
                Arc::clone(&driver),
                Arc::clone(&counters),
            )?),
            _ => None,
        };

        Ok(Self {
            domain,
            driver,
            mode,
            worker,
            counters,
        })
    }

    pub fn mode(&self) -> ActuationMode {
        self.mode
    }

    pub fn has_writer(&self) -> bool {
        self.worker.is_some()
    }

    pub fn counters(&self) -> Arc<ActuationCounters> {
        Arc::clone(&self.counters)
    }

    /// Never blocks. Shared domains are refused.
    pub fn dispatch(&self, freq: u32) -> GovernorResult<()> {
        if self.domain.is_shared() {
            return Err(GovernorError::SharedDomainUnsupported {
                domain: self.domain.id,
            });
        }

        match &self.worker {
            Some(worker) => {
                worker.request(freq);
                Ok(())
            }
            // writer already shut down
            None if self.mode == ActuationMode::Deferred => Ok(()),
            None => match self.driver.fast_switch(&self.domain, freq) {
                Ok(()) => {
                    self.counters.actuations.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            },
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    #[test]
    fn mailbox_coalesces_to_latest() {
        let mailbox = Mailbox::new();
        assert!(mailbox.post(1000));
        assert!(!mailbox.post(2000));
        assert_eq!(mailbox.take(), Some(2000));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn closed_mailbox_drops_requests() {
        let mailbox = Mailbox::new();
        mailbox.post(1000);
        mailbox.close();
        assert!(!mailbox.is_pending());
        assert!(!mailbox.post(2000));
        assert_eq!(mailbox.wait_for_request(), None);
    }

    /// Reports every blocking switch and waits for the test to release it
    struct GatedDriver {
        calls: Mutex<mpsc::Sender<u32>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl FrequencyDriver for GatedDriver {
        fn domains(&self) -> anyhow::Result<Vec<DomainInfo>> {
            Ok(Vec::new())
        }
        fn acquire(&self, _: &DomainInfo) -> GovernorResult<()> {
            Ok(())
        }
        fn release(&self, _: &DomainInfo) {}
        fn fast_switch(&self, _: &DomainInfo, _: u32) -> GovernorResult<()> {
            unreachable!("deferred domain")
        }
        fn blocking_switch(&self, _: &DomainInfo, freq: u32) -> GovernorResult<()> {
            let _ = self.calls.lock().send(freq);
            let _ = self.gate.lock().recv();
            Ok(())
        }
    }

    fn domain(cpus: Vec<u32>) -> Arc<DomainInfo> {
        Arc::new(DomainInfo {
            id: 0,
            cpus,
            min_freq: 800,
            max_freq: 3000,
            transition_delay_ns: 1_000_000,
            fast_switch: false,
        })
    }

    #[test]
    fn writer_coalesces_requests_posted_while_busy() {
        let (calls_tx, calls) = mpsc::channel();
        let (release, gate_rx) = mpsc::channel();
        let driver = Arc::new(GatedDriver {
            calls: Mutex::new(calls_tx),
            gate: Mutex::new(gate_rx),
        });
        let mut actuator = Actuator::new(domain(vec![0]), driver).unwrap();
        assert_eq!(actuator.mode(), ActuationMode::Deferred);
        assert!(actuator.has_writer());

        actuator.dispatch(1000).unwrap();
        let timeout = Duration::from_secs(5);
        assert_eq!(calls.recv_timeout(timeout).unwrap(), 1000);

        // writer is inside blocking_switch
        actuator.dispatch(2000).unwrap();
        actuator.dispatch(3000).unwrap();
        release.send(()).unwrap();

        assert_eq!(calls.recv_timeout(timeout).unwrap(), 3000);
        release.send(()).unwrap();
        assert!(calls.recv_timeout(Duration::from_millis(100)).is_err());

        drop(release);
        actuator.shutdown();
        assert_eq!(actuator.counters().actuations.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn shared_domain_is_refused() {
        let (calls_tx, calls) = mpsc::channel();
        let (_release, gate_rx) = mpsc::channel();
        let driver = Arc::new(GatedDriver {
            calls: Mutex::new(calls_tx),
            gate: Mutex::new(gate_rx),
        });
        let actuator = Actuator::new(domain(vec![0, 1]), driver).unwrap();
        assert_eq!(actuator.mode(), ActuationMode::Deferred);
        assert!(!actuator.has_writer());
        assert!(matches!(
            actuator.dispatch(1000),
            Err(GovernorError::SharedDomainUnsupported { domain: 0 })
        ));
        assert!(calls.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
