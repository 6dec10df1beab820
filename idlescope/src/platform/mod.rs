//! Linux platform plumbing
//!
//! Thin wrappers over sysfs and libc used by the providers and the
//! orchestrator:
//! - CPU enumeration from /sys
//! - Thread pinning
//! - Per-thread signal masking (user-space stand-in for interrupt masking)
//! - Futex wait/wake on the "measurement ongoing" word
//! - cpuidle state limiting

pub mod affinity;
pub mod cpu_utils;
pub mod cpuidle;
pub mod futex;
pub mod signals;

pub use affinity::pin_current_thread;
pub use cpu_utils::{online_cpus, parse_cpu_list};
pub use cpuidle::IdleStateLimiter;
pub use signals::SignalMask;
