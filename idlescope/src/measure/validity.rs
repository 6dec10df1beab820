//! Round validity
//!
//! An attempt is redone when a sleeping follower was woken too often, the
//! measured interval is shorter than requested, an energy counter did not
//! move, or a core left its loop before the leader's deadline.

use std::fmt;

use crate::domain::{CoreId, EntryMechanism, Nanos};
use crate::measure::counters::CounterDelta;

/// Per-core facts the checks need
#[derive(Debug, Clone, Copy)]
pub struct CoreObservation {
    pub core: CoreId,
    pub mechanism: EntryMechanism,
    pub wakeups: u64,
    pub left_early: bool,
    /// Per-core energy delta, on providers with per-core energy domains
    pub energy: Option<CounterDelta>,
}

/// Everything [`evaluate_round`] looks at for one attempt
#[derive(Debug, Clone)]
pub struct RoundObservation {
    pub target: Nanos,
    pub measured: Nanos,
    pub package_energy: Option<CounterDelta>,
    pub cores: Vec<CoreObservation>,
    /// A core raised the shared corrupted flag during the attempt
    pub corrupted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub spurious_wakes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    SpuriousWakeups { core: CoreId, wakeups: u64 },
    ShortDuration { measured: Nanos, target: Nanos },
    /// `None` is the package domain
    EnergyNotPositive { core: Option<CoreId> },
    LeftLoopEarly { core: CoreId },
    /// Flag raised without a per-core explanation
    Corrupted,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::SpuriousWakeups { core, wakeups } => {
                write!(f, "{core} woke up {wakeups} times")
            }
            Violation::ShortDuration { measured, target } => {
                write!(f, "measured {measured} shorter than target {target}")
            }
            Violation::EnergyNotPositive { core: None } => {
                write!(f, "package energy counter did not advance")
            }
            Violation::EnergyNotPositive { core: Some(core) } => {
                write!(f, "{core} energy counter did not advance")
            }
            Violation::LeftLoopEarly { core } => {
                write!(f, "{core} was unexpectedly interrupted during measurement")
            }
            Violation::Corrupted => write!(f, "round reported corrupted"),
        }
    }
}

/// Outcome of the checks; valid when no violation was found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validity {
    pub violations: Vec<Violation>,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn describe(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Wake counts of polling cores and of the leader are not checked: both
/// iterate by design.
pub fn evaluate_round(obs: &RoundObservation, thresholds: &Thresholds) -> Validity {
    let mut violations = Vec::new();

    for core in &obs.cores {
        if !core.core.is_leader()
            && !core.mechanism.exempt_from_wake_check()
            && core.wakeups >= thresholds.spurious_wakes
        {
            violations.push(Violation::SpuriousWakeups { core: core.core, wakeups: core.wakeups });
        }
    }

    if obs.measured < obs.target {
        violations.push(Violation::ShortDuration { measured: obs.measured, target: obs.target });
    }

    if obs.package_energy.is_some_and(|d| d.value == 0) {
        violations.push(Violation::EnergyNotPositive { core: None });
    }
    for core in &obs.cores {
        if core.energy.is_some_and(|d| d.value == 0) {
            violations.push(Violation::EnergyNotPositive { core: Some(core.core) });
        }
    }

    for core in obs.cores.iter().filter(|c| c.left_early) {
        violations.push(Violation::LeftLoopEarly { core: core.core });
    }

    let explained = violations
        .iter()
        .any(|v| matches!(v, Violation::SpuriousWakeups { .. } | Violation::LeftLoopEarly { .. }));
    if obs.corrupted && !explained {
        violations.push(Violation::Corrupted);
    }

    Validity { violations }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn observation(measured_ms: u64, wakes: [u64; 4]) -> RoundObservation {
        RoundObservation {
            target: Nanos(100 * MS),
            measured: Nanos(measured_ms * MS),
            package_energy: Some(CounterDelta { value: 5_000, wrapped: false }),
            cores: wakes
                .iter()
                .enumerate()
                .map(|(i, &wakeups)| CoreObservation {
                    core: CoreId(u32::try_from(i).unwrap()),
                    mechanism: EntryMechanism::HaltWait,
                    wakeups,
                    left_early: false,
                    energy: None,
                })
                .collect(),
            corrupted: false,
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds { spurious_wakes: 10 }
    }

    #[test]
    fn test_clean_round_is_accepted() {
        let validity = evaluate_round(&observation(105, [0, 1, 2, 0]), &thresholds());
        assert!(validity.is_valid());
    }

    #[test]
    fn test_short_round_is_rejected_once() {
        let validity = evaluate_round(&observation(95, [0, 1, 2, 0]), &thresholds());
        assert_eq!(
            validity.violations,
            vec![Violation::ShortDuration { measured: Nanos(95 * MS), target: Nanos(100 * MS) }]
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let validity = evaluate_round(&observation(105, [0, 9, 10, 0]), &thresholds());
        assert_eq!(
            validity.violations,
            vec![Violation::SpuriousWakeups { core: CoreId(2), wakeups: 10 }]
        );
    }

    #[test]
    fn test_leader_and_poll_cores_are_exempt() {
        let mut obs = observation(105, [500, 0, 0, 300]);
        obs.cores[3].mechanism = EntryMechanism::Poll;
        assert!(evaluate_round(&obs, &thresholds()).is_valid());
    }

    #[test]
    fn test_energy_must_advance() {
        let mut obs = observation(105, [0; 4]);
        obs.package_energy = Some(CounterDelta { value: 0, wrapped: false });
        obs.cores[1].energy = Some(CounterDelta { value: 0, wrapped: false });
        let validity = evaluate_round(&obs, &thresholds());
        assert_eq!(
            validity.violations,
            vec![
                Violation::EnergyNotPositive { core: None },
                Violation::EnergyNotPositive { core: Some(CoreId(1)) },
            ]
        );
    }

    #[test]
    fn test_missing_energy_counter_is_not_a_violation() {
        let mut obs = observation(105, [0; 4]);
        obs.package_energy = None;
        assert!(evaluate_round(&obs, &thresholds()).is_valid());
    }

    #[test]
    fn test_corrupted_flag_without_explanation() {
        let mut obs = observation(105, [0; 4]);
        obs.corrupted = true;
        assert_eq!(evaluate_round(&obs, &thresholds()).violations, vec![Violation::Corrupted]);

        obs.cores[2].left_early = true;
        assert_eq!(
            evaluate_round(&obs, &thresholds()).violations,
            vec![Violation::LeftLoopEarly { core: CoreId(2) }]
        );
    }

    #[test]
    fn test_violation_display() {
        let v = Violation::ShortDuration { measured: Nanos(95 * MS), target: Nanos(100 * MS) };
        assert_eq!(v.to_string(), "measured 95.000ms shorter than target 100.000ms");
    }
}
