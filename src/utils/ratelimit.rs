use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BURST: u32 = 10;

struct Window {
    begin: Option<Instant>,
    printed: u32,
}

/// Per-call-site message limiter: at most `burst` messages per `interval`.
///
/// `check` never blocks. When another thread is inside the limiter the
/// message is treated as suppressed.
pub struct Ratelimit {
    interval: Duration,
    burst: u32,
    window: Mutex<Window>,
    missed: AtomicU32,
}

impl Ratelimit {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            window: Mutex::new(Window {
                begin: None,
                printed: 0,
            }),
            missed: AtomicU32::new(0),
        }
    }

    /// `Some(missed)` when the caller may emit, with the number of messages
    /// dropped since the last emitted one.
    pub fn check(&self) -> Option<u32> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Option<u32> {
        let Some(mut window) = self.window.try_lock() else {
            self.missed.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let expired = match window.begin {
            Some(begin) => now.duration_since(begin) >= self.interval,
            None => true,
        };
        if expired {
            window.begin = Some(now);
            window.printed = 0;
        }

        if window.printed < self.burst {
            window.printed += 1;
            Some(self.missed.swap(0, Ordering::Relaxed))
        } else {
            self.missed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

impl Default for Ratelimit {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_BURST)
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! log_ratelimited {
    ($lvl:expr, $($arg:tt)+) => {{
        static LIMIT: ::once_cell::sync::Lazy<$crate::utils::ratelimit::Ratelimit> =
            ::once_cell::sync::Lazy::new($crate::utils::ratelimit::Ratelimit::default);
        if ::log::log_enabled!($lvl) {
            if let Some(missed) = LIMIT.check() {
                if missed > 0 {
                    ::log::log!($lvl, "{} similar messages suppressed", missed);
                }
                ::log::log!($lvl, $($arg)+);
            }
        }
    }};
}

/// `warn!` limited to a burst per interval at each call site
#[macro_export]
macro_rules! warn_ratelimited {
    ($($arg:tt)+) => {
        $crate::log_ratelimited!(::log::Level::Warn, $($arg)+)
    };
}

/// `error!` limited to a burst per interval at each call site
#[macro_export]
macro_rules! error_ratelimited {
    ($($arg:tt)+) => {
        $crate::log_ratelimited!(::log::Level::Error, $($arg)+)
    };
}
