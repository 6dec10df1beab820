//! Structured error types for idlescope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{CoreId, CpuId};
use thiserror::Error;

/// Fatal problems found before any core is armed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Entry mechanism '{0}' unknown (supported: POLL, MWAIT/HLT/WFI, IOPORT)")]
    UnknownMechanism(String),

    #[error("Entry mechanism IOPORT requires an I/O port address")]
    MissingIoPort,

    #[error("Invalid I/O port address '{0}'")]
    InvalidIoPort(String),

    #[error("Measurement duration must be greater than zero")]
    ZeroDuration,

    #[error("Measurement count must be greater than zero")]
    ZeroMeasurementCount,

    #[error("No cores available for measurement")]
    NoCores,

    #[error("Requested {requested} cores but only {available} are online")]
    TooManyCores { requested: usize, available: usize },

    #[error("CPU selection '{0}' unknown (supported: core, cpu_nr)")]
    UnknownCpuSelection(String),

    #[error("Idle state '{0}' not found in cpuidle")]
    IdleStateNotFound(String),
}

/// Failures reported by a counter/mechanism provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to access register {reg} (0x{addr:x}) on {cpu}: {source}")]
    RegisterAccess { reg: &'static str, addr: u64, cpu: CpuId, source: std::io::Error },

    #[error("Device {0} not available")]
    DeviceMissing(String),

    #[error("Provider '{0}' is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Injected register fault on {0}")]
    Injected(CoreId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures that abort a measurement run.
#[derive(Error, Debug)]
pub enum MeasureError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Failed to pin {core} to {cpu}: {source}")]
    PinFailed { core: CoreId, cpu: CpuId, source: std::io::Error },

    #[error("Measurement task on {0} panicked")]
    CorePanicked(CoreId),

    #[error("Measurement cancelled after {completed} of {requested} rounds")]
    Cancelled { completed: usize, requested: usize },

    #[error("Round index {index} outside of result series capacity {capacity}")]
    IndexOutOfRange { index: usize, capacity: usize },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write results to {path}: {source}")]
    WriteFailed { path: String, source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
