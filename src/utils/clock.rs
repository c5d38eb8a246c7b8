use std::io;

/// CLOCK_MONOTONIC in nanoseconds, the timebase handed to update hooks
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

/// The unit the calling thread is executing on
pub fn current_unit() -> io::Result<u32> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(cpu as u32)
}

/// Fails for unit ids a `cpu_set_t` cannot hold
pub fn check_unit(unit: u32) -> io::Result<()> {
    if unit as usize >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unit {unit} exceeds CPU_SETSIZE {}", libc::CPU_SETSIZE),
        ));
    }
    Ok(())
}

/// Restricts the calling thread to a single unit
pub fn pin_to_unit(unit: u32) -> io::Result<()> {
    check_unit(unit)?;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(unit as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = now_ns();
        let b = now_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn out_of_range_unit_is_an_error() {
        let unit = libc::CPU_SETSIZE as u32;
        assert_eq!(
            pin_to_unit(unit).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert!(check_unit(unit - 1).is_ok());
    }

    #[test]
    fn current_unit_is_reported() {
        assert!(current_unit().is_ok());
    }
}
