//! Thread pinning
//!
//! Every participant of a round runs on exactly one CPU for the whole round;
//! migration in the middle of the timed window would invalidate the per-core
//! counters it reads.

#![allow(unsafe_code)] // sched_setaffinity requires unsafe

use std::io;

use crate::domain::CpuId;

/// Pin the calling thread to `cpu`.
///
/// # Errors
/// Returns the OS error if the CPU is outside the allowed set (cgroups,
/// taskset) or does not exist.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: CpuId) -> io::Result<()> {
    let index = cpu.0 as usize;
    if index >= std::mem::size_of::<libc::cpu_set_t>() * 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{cpu} exceeds the cpu_set_t capacity"),
        ));
    }

    // SAFETY: cpu_set_t is valid when zeroed and index was bounds-checked above
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(index, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: CpuId) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "CPU affinity requires Linux"))
}

/// CPU the calling thread is currently running on, if the OS reports it
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<CpuId> {
    // SAFETY: sched_getcpu has no preconditions
    let cpu = unsafe { libc::sched_getcpu() };
    u32::try_from(cpu).ok().map(CpuId)
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<CpuId> {
    None
}
