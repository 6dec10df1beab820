//! # Counter/Mechanism Providers
//!
//! The measurement core drives every architecture through the
//! [`CounterProvider`] trait: counter reads at the start and end of a round,
//! deadline programming, one iteration of the sleep primitive, the stop
//! broadcast and per-core interrupt masking.
//!
//! ## Implementations
//!
//! - [`x86::X86Provider`]: TSC timestamps, RAPL energy and C-state residency
//!   MSRs through `/dev/cpu/N/msr` (Intel and AMD)
//! - [`arm::ArmProvider`]: generic timer timestamps, per-core deadlines
//! - [`sim::SimulatedProvider`]: deterministic software counters with fault
//!   injection, for tests and dry runs
//!
//! Exactly one provider is chosen at startup by [`select_provider`].

pub mod sim;

#[cfg(target_arch = "aarch64")]
pub mod arm;
#[cfg(target_arch = "x86_64")]
pub mod x86;

use std::time::Duration;

use idlescope_common::{CoreResidency, PackageResidency, ENERGY_COUNTER_MASK};

use crate::config::MeasurementConfig;
use crate::domain::{CoreId, EntryMechanism, Nanos, ProviderError, Ticks};
use crate::platform::futex::WaitOutcome;
use crate::platform::SignalMask;
use crate::sync::StopFlag;

/// Package-wide counters read by the leader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalCounters {
    /// Raw package energy counter (masked with the provider's counter mask)
    pub energy: Option<u64>,
    pub residency: Option<PackageResidency>,
}

/// Counters one core reads about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalCounters {
    pub unhalted: Option<u64>,
    pub residency: Option<CoreResidency>,
    /// Raw per-core energy counter
    pub energy: Option<u64>,
}

/// A point in the provider's tick domain at which a deadline expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeadlineToken(pub Ticks);

impl DeadlineToken {
    /// Placeholder published before the leader armed the real deadline
    pub const NEVER: DeadlineToken = DeadlineToken(Ticks(u64::MAX));

    pub fn expired(self, now: Ticks) -> bool {
        now >= self.0
    }
}

/// Why one iteration of the sleep primitive returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The caller's deadline passed
    Deadline,
    /// The stop word was cleared
    Signaled,
    /// Neither; the caller keeps looping
    Spurious,
}

/// Everything a provider needs for one sleep iteration
#[derive(Debug, Clone, Copy)]
pub struct SleepContext<'a> {
    pub core: CoreId,
    pub mechanism: EntryMechanism,
    /// Deadline this core wakes itself at, if any (the leader's, or a
    /// follower's locally armed one)
    pub deadline: Option<DeadlineToken>,
    pub stop: &'a StopFlag,
}

/// Saved interrupt state returned by [`CounterProvider::mask_interrupts`]
pub enum InterruptState {
    Signals(SignalMask),
    Unmasked,
}

/// Architecture-specific counter access and sleep primitives
///
/// Methods called inside a round run on the core they name, concurrently
/// with the other cores, so implementations must only touch per-core state
/// for local calls and must not block except in [`CounterProvider::sleep_once`].
pub trait CounterProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time setup before the first round (device handles, counter
    /// enables, idle-state limits)
    fn prepare(&mut self, _cfg: &MeasurementConfig) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Undo everything `prepare` changed; called even if a round failed
    fn cleanup(&mut self) {}

    /// Called by the orchestrator before every attempt, before any core runs
    fn begin_round(&self) {}

    /// Current timestamp of the calling core
    fn now(&self) -> Ticks;

    fn ticks_to_ns(&self, ticks: Ticks) -> Nanos;

    fn ns_to_ticks(&self, ns: Nanos) -> Ticks;

    /// Mask applied to the accumulating energy counters before deltas
    fn counter_mask(&self) -> u64 {
        ENERGY_COUNTER_MASK
    }

    /// Convert a raw energy counter delta to microjoules
    fn energy_to_uj(&self, raw: u64) -> u64 {
        raw
    }

    fn read_global_start_counters(&self) -> Result<GlobalCounters, ProviderError>;

    fn read_global_final_counters(&self) -> Result<GlobalCounters, ProviderError>;

    fn read_local_start_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError>;

    fn read_local_final_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError>;

    /// Program whatever ends the measurement `duration` from now
    fn arm_leader_deadline(
        &self,
        _core: CoreId,
        duration: Duration,
    ) -> Result<DeadlineToken, ProviderError> {
        Ok(DeadlineToken(Ticks(self.now().0.saturating_add(self.ns_to_ticks(duration.into()).0))))
    }

    /// Arm a core-local wake source on a follower, if the architecture
    /// needs one. `Some` means the follower wakes itself at that deadline.
    fn arm_follower_wakeup(
        &self,
        _core: CoreId,
        _duration: Duration,
    ) -> Result<Option<DeadlineToken>, ProviderError> {
        Ok(None)
    }

    /// Execute one iteration of the core's entry mechanism
    fn sleep_once(&self, ctx: &SleepContext<'_>) -> Wake;

    /// Leader only: clear the stop word and wake every other core
    fn signal_other_cores(&self, stop: &StopFlag) {
        stop.stop();
        stop.wake_all();
    }

    fn mask_interrupts(&self, _core: CoreId) -> Result<InterruptState, ProviderError> {
        Ok(InterruptState::Signals(SignalMask::block_all()?))
    }

    fn unmask_interrupts(&self, _core: CoreId, state: InterruptState) -> Result<(), ProviderError> {
        match state {
            InterruptState::Signals(mask) => Ok(mask.restore()?),
            InterruptState::Unmasked => Ok(()),
        }
    }

    /// Halt-and-wait on the stop word, bounded by the context's deadline
    fn halt_wait(&self, ctx: &SleepContext<'_>) -> Wake {
        if !ctx.stop.is_ongoing() {
            return Wake::Signaled;
        }

        let timeout = match ctx.deadline {
            Some(deadline) => {
                let now = self.now();
                if deadline.expired(now) {
                    return Wake::Deadline;
                }
                Some(Duration::from_nanos(self.ticks_to_ns(deadline.0.saturating_since(now)).0))
            }
            None => None,
        };

        let outcome = ctx.stop.wait(timeout);
        classify_wake(self, ctx, outcome)
    }
}

/// Map a wait outcome onto a [`Wake`]
///
/// A cleared stop word always wins. Only a timed-out wait can end on the
/// deadline; any other return is spurious and the next iteration re-checks.
pub fn classify_wake<P: CounterProvider + ?Sized>(
    provider: &P,
    ctx: &SleepContext<'_>,
    outcome: WaitOutcome,
) -> Wake {
    if !ctx.stop.is_ongoing() {
        return Wake::Signaled;
    }
    match outcome {
        WaitOutcome::TimedOut if ctx.deadline.is_some_and(|d| d.expired(provider.now())) => {
            Wake::Deadline
        }
        WaitOutcome::TimedOut
        | WaitOutcome::Woken
        | WaitOutcome::ValueChanged
        | WaitOutcome::Interrupted => Wake::Spurious,
    }
}

/// Which provider to instantiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// The hardware provider of the architecture this binary was built for
    #[default]
    Auto,
    /// Software counters, no privileges required
    Sim,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ProviderKind::Auto),
            "sim" => Ok(ProviderKind::Sim),
            other => Err(format!("unknown provider '{other}' (expected auto or sim)")),
        }
    }
}

/// Instantiate the provider for `kind` on this architecture
pub fn select_provider(kind: ProviderKind) -> Result<Box<dyn CounterProvider>, ProviderError> {
    match kind {
        ProviderKind::Sim => Ok(Box::new(sim::SimulatedProvider::new())),
        ProviderKind::Auto => native_provider(),
    }
}

#[cfg(target_arch = "x86_64")]
fn native_provider() -> Result<Box<dyn CounterProvider>, ProviderError> {
    Ok(Box::new(x86::X86Provider::new()?))
}

#[cfg(target_arch = "aarch64")]
fn native_provider() -> Result<Box<dyn CounterProvider>, ProviderError> {
    Ok(Box::new(arm::ArmProvider::new()?))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn native_provider() -> Result<Box<dyn CounterProvider>, ProviderError> {
    Err(ProviderError::Unsupported("auto"))
}
