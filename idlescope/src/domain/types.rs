//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing an OS CPU number
//! where a logical core identity is expected, or mixing provider ticks with
//! nanoseconds.

use std::fmt;
use std::str::FromStr;

use super::errors::ConfigError;

/// Logical core identity (0-indexed)
///
/// Position of a participant in the measurement, in `[0, core_count)`.
/// Core 0 is the leader. This is NOT the same as the OS CPU number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoreId(pub u32);

impl CoreId {
    pub const LEADER: CoreId = CoreId(0);

    /// Returns true for the core that owns package-wide setup
    pub fn is_leader(self) -> bool {
        self == Self::LEADER
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Core#{}", self.0)
    }
}

/// CPU ID
///
/// Represents an OS CPU number (0, 1, 2, ...) as listed in
/// `/sys/devices/system/cpu/online`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

/// Raw counter value in the provider's timestamp domain
/// (TSC ticks on x86, generic timer ticks on ARM, nanoseconds in simulation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Ticks(pub u64);

impl Ticks {
    /// Ticks elapsed since `earlier`, zero if `earlier` is later
    pub fn saturating_since(self, earlier: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(earlier.0))
    }
}

/// Duration in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Nanos(pub u64);

impl Nanos {
    /// Convert to milliseconds (f64)
    #[allow(clippy::cast_precision_loss)]
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to microseconds (u64)
    pub fn as_micros(self) -> u64 {
        self.0 / 1_000
    }
}

impl From<std::time::Duration> for Nanos {
    fn from(d: std::time::Duration) -> Self {
        Nanos(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Nanos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.as_millis();
        if ms >= 1.0 {
            write!(f, "{ms:.3}ms")
        } else {
            write!(f, "{}us", self.as_micros())
        }
    }
}

/// How a core waits during the timed interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryMechanism {
    /// Not selected or not recognized; never allowed into a round
    #[default]
    Unknown,
    /// Busy-read the counter until the deadline
    Poll,
    /// Halt the core until the stop word changes (monitor/mwait, hlt, wfi)
    HaltWait,
    /// Read an I/O port that triggers an idle-state entry
    IoPort,
}

impl EntryMechanism {
    pub fn is_poll(self) -> bool {
        self == EntryMechanism::Poll
    }

    /// Polling cores iterate constantly, so their wake count says nothing
    /// about disturbances.
    pub fn exempt_from_wake_check(self) -> bool {
        self.is_poll()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryMechanism::Unknown => "UNKNOWN",
            EntryMechanism::Poll => "POLL",
            EntryMechanism::HaltWait => "HALTWAIT",
            EntryMechanism::IoPort => "IOPORT",
        }
    }
}

impl fmt::Display for EntryMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryMechanism {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POLL" => Ok(EntryMechanism::Poll),
            "MWAIT" | "HLT" | "HALT" | "WFI" | "HALTWAIT" => Ok(EntryMechanism::HaltWait),
            "IOPORT" => Ok(EntryMechanism::IoPort),
            _ => Err(ConfigError::UnknownMechanism(s.to_string())),
        }
    }
}
