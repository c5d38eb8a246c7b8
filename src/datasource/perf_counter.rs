use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use log::{debug, error, info};

use crate::{
    datasource::event_map::EventDescriptor,
    error::{CounterError, GovernorError, GovernorResult},
};

/// Absolute counter values for the events a domain was started with
pub trait CounterSource: Send {
    fn read(&mut self, index: usize) -> Result<u64, CounterError>;
    fn event_count(&self) -> usize;
}

/// Opens a [`CounterSource`] bound to one unit
pub trait CounterProvider: Send + Sync {
    fn open(&self, unit: u32, events: &[EventDescriptor]) -> GovernorResult<Box<dyn CounterSource>>;
}

const PERF_ATTR_SIZE_VER5: u32 = 112;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

/// `struct perf_event_attr` up to `PERF_ATTR_SIZE_VER5`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

impl PerfEventAttr {
    /// Counting mode, user space only, enabled as soon as it is opened
    fn counting(event: &EventDescriptor) -> Self {
        Self {
            type_: event.kind.perf_type(),
            size: PERF_ATTR_SIZE_VER5,
            config: event.config,
            flags: ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV,
            ..Default::default()
        }
    }
}

/// One open counting event; the descriptor is closed on drop
pub struct PerfEvent {
    fd: OwnedFd,
}

impl PerfEvent {
    pub fn open(unit: u32, event: &EventDescriptor) -> io::Result<Self> {
        let attr = PerfEventAttr::counting(event);
        let ret = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                -1 as libc::pid_t,
                unit as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(ret as libc::c_int) };
        Ok(Self { fd })
    }

    pub fn read_value(&self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != std::mem::size_of::<u64>() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short perf read"));
        }
        Ok(value)
    }
}

pub fn classify_read_error(err: &io::Error) -> CounterError {
    match err.raw_os_error() {
        Some(libc::ENODEV) | Some(libc::EOPNOTSUPP) | Some(libc::ENOENT) => {
            CounterError::Unsupported
        }
        _ => CounterError::TransientReadFailure,
    }
}

pub struct PerfCounterSource {
    events: Vec<PerfEvent>,
}

impl CounterSource for PerfCounterSource {
    fn read(&mut self, index: usize) -> Result<u64, CounterError> {
        let event = self.events.get(index).ok_or(CounterError::Unsupported)?;
        event.read_value().map_err(|e| classify_read_error(&e))
    }

    fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// Opens real perf events through `perf_event_open(2)`
#[derive(Debug, Default)]
pub struct PerfCounterProvider;

impl CounterProvider for PerfCounterProvider {
    fn open(&self, unit: u32, events: &[EventDescriptor]) -> GovernorResult<Box<dyn CounterSource>> {
        debug!("Allocating perf counters on unit {unit}");
        // already opened events are closed when `opened` drops on the error path
        let mut opened = Vec::with_capacity(events.len());
        for (index, event) in events.iter().enumerate() {
            let perf = PerfEvent::open(unit, event).map_err(|e| {
                error!(
                    "Failed to allocate perf counter for event{}=\"{}\": {e}",
                    index + 1,
                    event.name
                );
                GovernorError::CounterUnavailable {
                    index,
                    name: event.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            opened.push(perf);
        }
        info!("Allocated {} perf counters on unit {unit}", opened.len());
        Ok(Box::new(PerfCounterSource { events: opened }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), PERF_ATTR_SIZE_VER5 as usize);
    }

    #[test]
    fn counting_attr_excludes_kernel_and_hypervisor() {
        let event = EventDescriptor {
            name: "cycles".into(),
            kind: crate::datasource::event_map::EventKind::Hardware,
            config: 0,
            period: 0,
        };
        let attr = PerfEventAttr::counting(&event);
        assert_eq!(attr.type_, 0);
        assert_eq!(attr.flags & 1, 0, "event must start enabled");
        assert_ne!(attr.flags & ATTR_EXCLUDE_KERNEL, 0);
        assert_ne!(attr.flags & ATTR_EXCLUDE_HV, 0);
    }

    #[test]
    fn read_errors_are_classified() {
        let unsupported = io::Error::from_raw_os_error(libc::ENODEV);
        assert_eq!(classify_read_error(&unsupported), CounterError::Unsupported);
        let transient = io::Error::from_raw_os_error(libc::EINTR);
        assert_eq!(classify_read_error(&transient), CounterError::TransientReadFailure);
    }
}
