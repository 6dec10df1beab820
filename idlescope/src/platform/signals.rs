//! Per-thread signal masking
//!
//! User space cannot mask hardware interrupts. Blocking every maskable signal
//! on the measuring thread removes the one asynchronous source of
//! interference a process does control: signal handlers running on a core in
//! the middle of its timed window.

#![allow(unsafe_code)] // pthread_sigmask requires unsafe

use std::io;

/// Saved signal mask of the calling thread
///
/// Created by [`SignalMask::block_all`]; [`SignalMask::restore`] puts the
/// saved mask back. The mask belongs to the thread that created it.
pub struct SignalMask {
    previous: libc::sigset_t,
}

impl SignalMask {
    /// Block all signals on the calling thread and remember the previous mask
    ///
    /// SIGKILL and SIGSTOP cannot be blocked and stay deliverable.
    pub fn block_all() -> io::Result<Self> {
        // SAFETY: both sets are initialized by sigfillset/pthread_sigmask before use
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut previous);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(Self { previous })
        }
    }

    /// Reinstate the mask captured by `block_all`
    pub fn restore(self) -> io::Result<()> {
        // SAFETY: previous was filled by pthread_sigmask in block_all
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }
}

/// True if `signal` is currently blocked on the calling thread
pub fn is_blocked(signal: libc::c_int) -> io::Result<bool> {
    // SAFETY: current is filled by pthread_sigmask before being read
    unsafe {
        let mut current: libc::sigset_t = std::mem::zeroed();
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(libc::sigismember(&current, signal) == 1)
    }
}
