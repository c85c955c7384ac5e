use std::{io, mem};

use log::info;

use crate::error::{BenchError, Result};

/// Pins the calling thread to `core`.
pub fn pin_current_thread(core: usize) -> Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(BenchError::InvalidInput(format!("core {core} out of range")));
    }
    // SAFETY: cpu_set_t is plain data and the mask outlives the call
    let ret = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        return Err(BenchError::Setup(format!(
            "failed to pin thread to core {core}: {}",
            io::Error::last_os_error()
        )));
    }
    info!("thread pinned to core {core}");
    Ok(())
}

/// Cores the calling thread may run on.
pub fn allowed_cores() -> Result<Vec<usize>> {
    // SAFETY: cpu_set_t is plain data filled in by the kernel
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|core| libc::CPU_ISSET(*core, &set))
            .collect())
    }
}
