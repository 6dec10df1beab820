//! Measurement configuration
//!
//! [`ConfigInput`] carries raw values (from the CLI or a library caller);
//! [`MeasurementConfig::build`] validates them before any hardware state is
//! touched. Every validation failure is a fatal [`ConfigError`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use idlescope_common::{
    DEFAULT_MAX_RETRIES, DEFAULT_SPURIOUS_WAKE_THRESHOLD, MAX_NUMBER_OF_MEASUREMENTS,
};
use log::warn;

use crate::domain::{ConfigError, CoreId, CpuId, EntryMechanism};

/// How the cores that actually sleep are picked when not all of them do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuSelection {
    /// Spread over physical cores first: the first half of the CPU numbers
    /// take the even ranks, the second half (their SMT siblings) the odd ones
    #[default]
    Core,
    /// Lowest CPU numbers first
    CpuNr,
}

impl CpuSelection {
    /// Whether core `index` of `count` is one of the first `idle_cores` sleepers
    pub fn sleeps(self, index: usize, count: usize, idle_cores: usize) -> bool {
        let rank = match self {
            CpuSelection::CpuNr => index,
            CpuSelection::Core => {
                let half = count / 2;
                if index < half {
                    2 * index
                } else {
                    (index - half) * 2 + 1
                }
            }
        };
        rank < idle_cores
    }
}

impl FromStr for CpuSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "core" => Ok(CpuSelection::Core),
            "cpu_nr" => Ok(CpuSelection::CpuNr),
            other => Err(ConfigError::UnknownCpuSelection(other.to_string())),
        }
    }
}

impl fmt::Display for CpuSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuSelection::Core => "core",
            CpuSelection::CpuNr => "cpu_nr",
        })
    }
}

/// Unvalidated configuration values
#[derive(Debug, Clone)]
pub struct ConfigInput {
    pub duration: Duration,
    pub measurement_count: usize,
    pub mechanism: String,
    /// Number of cores that use `mechanism`; negative means all of them
    pub idle_cores: i64,
    pub cpu_selection: String,
    pub io_port: Option<String>,
    pub idle_state: Option<String>,
    pub deactivate_package_cstates: bool,
    pub max_retries: u32,
    pub spurious_wake_threshold: u64,
    pub pin_threads: bool,
    /// OS CPUs taking part, in core identity order (first one leads)
    pub cpus: Vec<CpuId>,
}

impl Default for ConfigInput {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(100),
            measurement_count: 10,
            mechanism: "MWAIT".to_string(),
            idle_cores: -1,
            cpu_selection: "core".to_string(),
            io_port: None,
            idle_state: None,
            deactivate_package_cstates: false,
            max_retries: DEFAULT_MAX_RETRIES,
            spurious_wake_threshold: DEFAULT_SPURIOUS_WAKE_THRESHOLD,
            pin_threads: true,
            cpus: Vec::new(),
        }
    }
}

/// Validated, immutable measurement configuration
#[derive(Debug, Clone)]
pub struct MeasurementConfig {
    target_duration: Duration,
    measurement_count: usize,
    requested_mechanism: EntryMechanism,
    mechanisms: Vec<EntryMechanism>,
    cpus: Vec<CpuId>,
    cpu_selection: CpuSelection,
    idle_cores: usize,
    io_port: Option<u16>,
    idle_state: Option<String>,
    deactivate_package_cstates: bool,
    max_retries: u32,
    spurious_wake_threshold: u64,
    pin_threads: bool,
}

impl MeasurementConfig {
    /// Validate `input`
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found; nothing has been armed or
    /// written at that point.
    pub fn build(input: ConfigInput) -> Result<Self, ConfigError> {
        if input.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if input.measurement_count == 0 {
            return Err(ConfigError::ZeroMeasurementCount);
        }
        if input.cpus.is_empty() {
            return Err(ConfigError::NoCores);
        }

        let measurement_count = if input.measurement_count > MAX_NUMBER_OF_MEASUREMENTS {
            warn!(
                "Measurement count {} exceeds the maximum, clamping to {}",
                input.measurement_count, MAX_NUMBER_OF_MEASUREMENTS
            );
            MAX_NUMBER_OF_MEASUREMENTS
        } else {
            input.measurement_count
        };

        let requested_mechanism: EntryMechanism = input.mechanism.parse()?;
        if requested_mechanism == EntryMechanism::Unknown {
            return Err(ConfigError::UnknownMechanism(input.mechanism));
        }

        let io_port = match (requested_mechanism, input.io_port.as_deref()) {
            (EntryMechanism::IoPort, None) => return Err(ConfigError::MissingIoPort),
            (_, Some(raw)) => Some(parse_io_port(raw)?),
            (_, None) => None,
        };

        let cpu_selection: CpuSelection = input.cpu_selection.parse()?;
        let count = input.cpus.len();
        let idle_cores = usize::try_from(input.idle_cores).map_or(count, |n| n.min(count));

        let mechanisms = (0..count)
            .map(|i| {
                if cpu_selection.sleeps(i, count, idle_cores) {
                    requested_mechanism
                } else {
                    EntryMechanism::Poll
                }
            })
            .collect();

        Ok(Self {
            target_duration: input.duration,
            measurement_count,
            requested_mechanism,
            mechanisms,
            cpus: input.cpus,
            cpu_selection,
            idle_cores,
            io_port,
            idle_state: input.idle_state,
            deactivate_package_cstates: input.deactivate_package_cstates,
            max_retries: input.max_retries,
            spurious_wake_threshold: input.spurious_wake_threshold,
            pin_threads: input.pin_threads,
        })
    }

    pub fn core_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    pub fn measurement_count(&self) -> usize {
        self.measurement_count
    }

    pub fn requested_mechanism(&self) -> EntryMechanism {
        self.requested_mechanism
    }

    /// Entry mechanism of `core` (Poll for cores not selected to sleep)
    pub fn mechanism(&self, core: CoreId) -> EntryMechanism {
        self.mechanisms.get(core.index()).copied().unwrap_or_default()
    }

    pub fn mechanisms(&self) -> &[EntryMechanism] {
        &self.mechanisms
    }

    /// OS CPU that `core` runs on
    pub fn cpu(&self, core: CoreId) -> CpuId {
        self.cpus[core.index()]
    }

    pub fn cpus(&self) -> &[CpuId] {
        &self.cpus
    }

    pub fn cores(&self) -> impl Iterator<Item = CoreId> {
        (0..self.core_count()).map(|i| CoreId(u32::try_from(i).unwrap_or(u32::MAX)))
    }

    pub fn cpu_selection(&self) -> CpuSelection {
        self.cpu_selection
    }

    pub fn idle_cores(&self) -> usize {
        self.idle_cores
    }

    pub fn io_port(&self) -> Option<u16> {
        self.io_port
    }

    pub fn idle_state(&self) -> Option<&str> {
        self.idle_state.as_deref()
    }

    pub fn deactivate_package_cstates(&self) -> bool {
        self.deactivate_package_cstates
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn spurious_wake_threshold(&self) -> u64 {
        self.spurious_wake_threshold
    }

    pub fn pin_threads(&self) -> bool {
        self.pin_threads
    }
}

/// Parse an I/O port address given as decimal or `0x`-prefixed hex
pub fn parse_io_port(raw: &str) -> Result<u16, ConfigError> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidIoPort(raw.to_string()))
}
