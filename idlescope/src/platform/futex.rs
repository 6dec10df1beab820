//! Futex wait/wake on a 32-bit word
//!
//! The halt-and-wait entry mechanism blocks the core in the kernel until the
//! leader changes the "measurement ongoing" word, which lets the kernel's idle
//! loop put the CPU into its idle state. This is the user-space counterpart of
//! arming a monitor on that word and halting.

#![allow(unsafe_code)] // raw futex syscalls

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Outcome of a single futex wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by `wake_all` (or a spurious kernel wakeup)
    Woken,
    /// The word no longer held the expected value when the wait started
    ValueChanged,
    /// The timeout elapsed
    TimedOut,
    /// Interrupted by a signal or another transient condition
    Interrupted,
}

/// Block while `*word == expected`, for at most `timeout` (forever if `None`)
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: libc::time_t::try_from(t.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_nsec: libc::c_long::try_from(t.subsec_nanos()).unwrap_or(0),
    });
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| std::ptr::from_ref(t));

    // SAFETY: word points to a live AtomicU32 for the duration of the call and
    // ts_ptr is either null or points to a timespec on this stack frame
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };

    if rc == 0 {
        return WaitOutcome::Woken;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WaitOutcome::ValueChanged,
        Some(libc::ETIMEDOUT) => WaitOutcome::TimedOut,
        _ => WaitOutcome::Interrupted,
    }
}

/// Wake every thread blocked on `word`
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) {
    // SAFETY: word points to a live AtomicU32
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            libc::c_int::MAX,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) != expected {
        return WaitOutcome::ValueChanged;
    }
    std::thread::sleep(timeout.unwrap_or(Duration::from_micros(50)).min(Duration::from_micros(50)));
    WaitOutcome::Interrupted
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) {}
