//! # Shared Result Structures (Measurement ↔ Consumers)
//!
//! Defines the per-round result records produced by the `idlescope`
//! measurement core and consumed by exporters, the live printer and any
//! external tooling that reads exported results back in.
//!
//! With the `serde` feature enabled every type derives `Serialize` and
//! `Deserialize` so a JSON export can be parsed back into the same structures.
//!
//! ## Key Types
//!
//! - [`GlobalResult`] - Package-wide values owned by the leader core
//! - [`PerCoreResult`] - Values one core captured about itself
//! - [`RoundRecord`] - One accepted round: global + per-core + retry diagnostics

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on the number of rounds a single run may record.
///
/// Requested measurement counts above this are clamped at configuration time.
pub const MAX_NUMBER_OF_MEASUREMENTS: usize = 1000;

/// Width mask of the RAPL energy status counters (32 significant bits).
///
/// Both the package and the AMD per-core energy registers wrap at this mask.
pub const ENERGY_COUNTER_MASK: u64 = 0xffff_ffff;

/// Default number of wake iterations at which a sleeping follower is
/// considered disturbed.
pub const DEFAULT_SPURIOUS_WAKE_THRESHOLD: u64 = 10;

/// Default number of redos before an invalid round is accepted anyway.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

// ============================================================================
// Residency Counters
// ============================================================================

/// Package C-state residency deltas over one round, in counter ticks.
///
/// Only reported by providers that expose package residency registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PackageResidency {
    pub c2: u64,
    pub c3: u64,
    pub c6: u64,
    pub c7: u64,
}

/// Core C-state residency deltas over one round, in counter ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoreResidency {
    pub c3: u64,
    pub c6: u64,
    pub c7: u64,
}

// ============================================================================
// Round Results
// ============================================================================

/// Package-wide result of one round.
///
/// Every field is written by the leader core only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalResult {
    /// Leader timestamp taken right after the global start counters
    /// (provider tick domain).
    pub start_ticks: u64,

    /// Leader timestamp taken right after the global final counters.
    pub end_ticks: u64,

    /// `end_ticks - start_ticks`
    pub total_ticks: u64,

    /// `total_ticks` converted to nanoseconds.
    pub duration_ns: u64,

    /// Package energy consumed, in microjoules.
    ///
    /// `None` when the provider has no energy counter.
    pub energy_uj: Option<u64>,

    /// True if the package energy counter wrapped during the round.
    pub energy_wrapped: bool,

    /// Package idle-state residency deltas, if the provider reports them.
    pub residency: Option<PackageResidency>,
}

/// Result one core captured about itself during a round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PerCoreResult {
    /// Logical core identity (0 is the leader).
    pub core: u32,

    /// OS CPU number the core's task was pinned to.
    pub cpu: u32,

    /// Entry mechanism name used by this core (`POLL`, `HALTWAIT`, `IOPORT`).
    pub mechanism: String,

    /// Number of iterations of the sleep/poll loop.
    pub wakeups: u64,

    /// Iterations the provider reported as spurious (neither deadline nor stop).
    pub spurious_wakeups: u64,

    /// Time between the wake trigger and the core noticing it, in nanoseconds.
    ///
    /// The trigger is the deadline for the leader and for polling cores, and
    /// the leader's stop signal for everyone else.
    pub wakeup_latency_ns: u64,

    /// Unhalted reference cycles over the round.
    pub unhalted: Option<u64>,

    /// Core idle-state residency deltas.
    pub residency: Option<CoreResidency>,

    /// Core energy in microjoules (per-core RAPL domains only).
    pub energy_uj: Option<u64>,

    /// Register accesses that failed during the round on this core.
    pub hardware_faults: u32,
}

/// One accepted round as stored in the result series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoundRecord {
    /// Position of the round in the series.
    pub index: usize,

    pub global: GlobalResult,

    /// One entry per core, ordered by core identity.
    pub cores: Vec<PerCoreResult>,

    /// How many times the round was executed (1 = accepted first time).
    pub attempts: u32,

    /// False when the retry budget ran out and the last attempt was
    /// accepted despite violations.
    pub valid: bool,

    /// Violations found in the accepted attempt (empty when `valid`).
    pub violations: Vec<String>,
}

impl RoundRecord {
    /// Number of redos the round needed before it was accepted.
    pub fn redos(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redos_counts_attempts_after_first() {
        let record = RoundRecord { attempts: 3, ..Default::default() };
        assert_eq!(record.redos(), 2);

        let fresh = RoundRecord::default();
        assert_eq!(fresh.redos(), 0);
    }

    #[test]
    fn test_energy_mask_is_32_bits() {
        assert_eq!(ENERGY_COUNTER_MASK + 1, 1u64 << 32);
    }
}
