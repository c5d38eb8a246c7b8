use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
    datasource::file_path::TICKER_THREAD,
    error::{GovernorError, GovernorResult},
    utils::clock::{check_unit, current_unit, now_ns, pin_to_unit},
    warn_ratelimited,
};

/// Called with the unit it executes on and a monotonic timestamp in ns
pub type UpdateCallback = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// Source of utilization update events.
///
/// After `deregister_update_hook` returns the callback is not running and
/// will not be called again.
pub trait UpdateHookHost: Send + Sync {
    fn register_update_hook(&self, unit: u32, callback: UpdateCallback) -> GovernorResult<()>;
    fn deregister_update_hook(&self, unit: u32);
}

struct Ticker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Fires every registered callback from a thread pinned to its unit
pub struct TickerHost {
    tick: Duration,
    tickers: Mutex<HashMap<u32, Ticker>>,
}

impl TickerHost {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            tickers: Mutex::new(HashMap::new()),
        }
    }

    fn run(unit: u32, tick: Duration, stop: &AtomicBool, callback: &UpdateCallback) {
        if let Err(e) = pin_to_unit(unit) {
            warn!("{TICKER_THREAD}-{unit}: failed to pin: {e}");
        }
        debug!("{TICKER_THREAD}-{unit} Start");

        while !stop.load(Ordering::Acquire) {
            thread::sleep(tick);
            if stop.load(Ordering::Acquire) {
                break;
            }
            match current_unit() {
                Ok(running_on) => callback(running_on, now_ns()),
                Err(e) => warn_ratelimited!("{TICKER_THREAD}-{unit}: sched_getcpu failed: {e}"),
            }
        }
        debug!("{TICKER_THREAD}-{unit} Exit");
    }
}

impl UpdateHookHost for TickerHost {
    fn register_update_hook(&self, unit: u32, callback: UpdateCallback) -> GovernorResult<()> {
        check_unit(unit)?;
        let mut tickers = self.tickers.lock();
        if tickers.contains_key(&unit) {
            return Err(GovernorError::HookBusy(unit));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let tick = self.tick;
        let handle = thread::Builder::new()
            .name(format!("{TICKER_THREAD}-{unit}"))
            .spawn(move || Self::run(unit, tick, &thread_stop, &callback))
            .map_err(|e| GovernorError::AllocationFailure {
                what: "update ticker thread",
                reason: e.to_string(),
            })?;

        tickers.insert(unit, Ticker { stop, handle });
        info!("Update hook registered on unit {unit}, tick {}us", tick.as_micros());
        Ok(())
    }

    fn deregister_update_hook(&self, unit: u32) {
        let Some(ticker) = self.tickers.lock().remove(&unit) else {
            return;
        };
        ticker.stop.store(true, Ordering::Release);
        if ticker.handle.join().is_err() {
            warn!("{TICKER_THREAD}-{unit} panicked");
        }
        info!("Update hook deregistered on unit {unit}");
    }
}

impl Drop for TickerHost {
    fn drop(&mut self) {
        let units: Vec<u32> = self.tickers.lock().keys().copied().collect();
        for unit in units {
            self.deregister_update_hook(unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[test]
    fn ticks_until_deregistered() {
        let host = TickerHost::new(Duration::from_millis(1));
        let unit = current_unit().unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        host.register_update_hook(
            unit,
            Arc::new(move |_, now| {
                assert!(now > 0);
                seen.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        host.deregister_update_hook(unit);
        let after_stop = calls.load(Ordering::Relaxed);
        assert!(after_stop > 0);

        thread::sleep(Duration::from_millis(10));
        assert_eq!(calls.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn second_registration_is_busy() {
        let host = TickerHost::new(Duration::from_millis(5));
        let noop: UpdateCallback = Arc::new(|_, _| {});
        host.register_update_hook(0, Arc::clone(&noop)).unwrap();
        assert!(matches!(
            host.register_update_hook(0, noop),
            Err(GovernorError::HookBusy(0))
        ));
        host.deregister_update_hook(0);
        host.deregister_update_hook(0);
    }

    #[test]
    fn out_of_range_unit_is_refused_before_spawning() {
        let host = TickerHost::new(Duration::from_millis(5));
        let noop: UpdateCallback = Arc::new(|_, _| {});
        assert!(matches!(
            host.register_update_hook(u32::MAX, noop),
            Err(GovernorError::Io(_))
        ));
        assert!(host.tickers.lock().is_empty());
    }
}
