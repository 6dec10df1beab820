//! Software counters for unprivileged runs and tests
//!
//! Timestamps are nanoseconds on a simulated clock that follows the monotonic
//! clock. The package energy counter restarts at `energy_offset` on every
//! global start read, advances by one microjoule per simulated microsecond
//! and wraps at the 32-bit mask. Core C6 residency accumulates the time a
//! core spent blocked in halt-wait.
//!
//! [`SimFaults`] injects the disturbances the validity checks look for, keyed
//! by the attempt number (1-based, counted across the whole run). Injected
//! faults do not depend on how the threads of an attempt get scheduled.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use idlescope_common::CoreResidency;
use log::debug;

use super::{
    CounterProvider, DeadlineToken, GlobalCounters, LocalCounters, SleepContext, Wake,
};
use crate::config::MeasurementConfig;
use crate::domain::{CoreId, Nanos, ProviderError, Ticks};

/// Spurious wakeups reported to one core's sleep loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpuriousFault {
    pub core: CoreId,
    /// Spurious iterations per affected attempt
    pub wakes: u64,
    /// Attempts `1..=attempts` are affected
    pub attempts: u32,
}

/// Disturbances to inject
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Attempts `1..=n` fire the leader deadline immediately and stall the
    /// clock, so their measured window is always empty
    pub early_deadline_attempts: u32,
    pub spurious: Option<SpuriousFault>,
    /// Attempts `1..=n` report no energy consumed
    pub frozen_energy_attempts: u32,
    /// Every local counter read on this core fails
    pub failing_local_reads: Option<CoreId>,
    /// Raw value of the energy counter at each global start read
    pub energy_offset: u64,
}

#[derive(Debug, Default)]
struct SimCore {
    slept_ns: AtomicU64,
    spurious_left: AtomicU64,
}

#[derive(Debug)]
pub struct SimulatedProvider {
    epoch: Instant,
    faults: SimFaults,
    attempt: AtomicU32,
    /// Real and simulated time at the start of the current attempt
    anchor_real: AtomicU64,
    anchor_sim: AtomicU64,
    stalled: AtomicBool,
    /// Simulated microseconds at the last global start read
    energy_anchor_us: AtomicU64,
    cores: Vec<SimCore>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::with_faults(SimFaults::default())
    }

    pub fn with_faults(faults: SimFaults) -> Self {
        Self {
            epoch: Instant::now(),
            faults,
            attempt: AtomicU32::new(0),
            anchor_real: AtomicU64::new(0),
            anchor_sim: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
            energy_anchor_us: AtomicU64::new(0),
            cores: Vec::new(),
        }
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempt.load(Ordering::Relaxed)
    }

    /// Whether the current attempt is one of the first `n`
    fn affected(&self, n: u32) -> bool {
        (1..=n).contains(&self.attempt.load(Ordering::Relaxed))
    }

    fn real_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn now_us(&self) -> u64 {
        self.ticks_to_ns(self.now()).as_micros()
    }

    fn energy_raw(&self) -> u64 {
        let consumed = self.now_us().saturating_sub(self.energy_anchor_us.load(Ordering::Relaxed));
        self.faults.energy_offset.wrapping_add(consumed) & self.counter_mask()
    }

    fn local_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError> {
        if self.faults.failing_local_reads == Some(core) {
            return Err(ProviderError::Injected(core));
        }
        let slept = self.cores.get(core.index()).map_or(0, |c| c.slept_ns.load(Ordering::Relaxed));
        Ok(LocalCounters {
            unhalted: Some(self.now().0.saturating_sub(slept)),
            residency: Some(CoreResidency { c3: 0, c6: slept, c7: 0 }),
            energy: None,
        })
    }
}

impl CounterProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn prepare(&mut self, cfg: &MeasurementConfig) -> Result<(), ProviderError> {
        self.cores = (0..cfg.core_count()).map(|_| SimCore::default()).collect();
        debug!("Simulated provider prepared for {} cores, faults: {:?}", cfg.core_count(), self.faults);
        Ok(())
    }

    fn begin_round(&self) {
        let sim = self.now();
        self.anchor_real.store(self.real_ns(), Ordering::Relaxed);
        self.anchor_sim.store(sim.0, Ordering::Relaxed);

        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
        self.stalled.store(self.affected(self.faults.early_deadline_attempts), Ordering::Relaxed);
        for (i, core) in self.cores.iter().enumerate() {
            let spurious = match self.faults.spurious {
                Some(f) if f.core.index() == i && attempt <= f.attempts => f.wakes,
                _ => 0,
            };
            core.spurious_left.store(spurious, Ordering::Relaxed);
        }
    }

    fn now(&self) -> Ticks {
        let anchor = self.anchor_sim.load(Ordering::Relaxed);
        if self.stalled.load(Ordering::Relaxed) {
            return Ticks(anchor);
        }
        let since = self.real_ns().saturating_sub(self.anchor_real.load(Ordering::Relaxed));
        Ticks(anchor.saturating_add(since))
    }

    fn ticks_to_ns(&self, ticks: Ticks) -> Nanos {
        Nanos(ticks.0)
    }

    fn ns_to_ticks(&self, ns: Nanos) -> Ticks {
        Ticks(ns.0)
    }

    fn read_global_start_counters(&self) -> Result<GlobalCounters, ProviderError> {
        self.energy_anchor_us.store(self.now_us(), Ordering::Relaxed);
        Ok(GlobalCounters { energy: Some(self.energy_raw()), residency: None })
    }

    fn read_global_final_counters(&self) -> Result<GlobalCounters, ProviderError> {
        let energy = if self.affected(self.faults.frozen_energy_attempts) {
            self.faults.energy_offset & self.counter_mask()
        } else {
            self.energy_raw()
        };
        Ok(GlobalCounters { energy: Some(energy), residency: None })
    }

    fn read_local_start_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError> {
        self.local_counters(core)
    }

    fn read_local_final_counters(&self, core: CoreId) -> Result<LocalCounters, ProviderError> {
        self.local_counters(core)
    }

    fn arm_leader_deadline(
        &self,
        _core: CoreId,
        duration: Duration,
    ) -> Result<DeadlineToken, ProviderError> {
        let duration = if self.affected(self.faults.early_deadline_attempts) {
            Duration::ZERO
        } else {
            duration
        };
        Ok(DeadlineToken(Ticks(self.now().0.saturating_add(self.ns_to_ticks(duration.into()).0))))
    }

    fn sleep_once(&self, ctx: &SleepContext<'_>) -> Wake {
        let state = self.cores.get(ctx.core.index());

        if let Some(state) = state {
            let injected = state
                .spurious_left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
                .is_ok();
            if injected {
                return Wake::Spurious;
            }
        }

        let before = self.now();
        let wake = self.halt_wait(ctx);
        if let Some(state) = state {
            state.slept_ns.fetch_add(self.now().0.saturating_sub(before.0), Ordering::Relaxed);
        }
        wake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigInput, MeasurementConfig};
    use crate::domain::{CpuId, EntryMechanism};
    use crate::sync::StopFlag;

    fn prepared(faults: SimFaults, cores: u32) -> SimulatedProvider {
        let mut provider = SimulatedProvider::with_faults(faults);
        let cfg = MeasurementConfig::build(ConfigInput {
            cpus: (0..cores).map(CpuId).collect(),
            ..Default::default()
        })
        .unwrap();
        provider.prepare(&cfg).unwrap();
        provider
    }

    #[test]
    fn test_energy_advances_with_time() {
        let provider = prepared(SimFaults::default(), 1);
        provider.begin_round();
        let start = provider.read_global_start_counters().unwrap().energy.unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let end = provider.read_global_final_counters().unwrap().energy.unwrap();
        assert!(end >= start + 1_000);
    }

    #[test]
    fn test_frozen_energy_only_for_configured_attempts() {
        let provider = prepared(SimFaults { frozen_energy_attempts: 1, ..Default::default() }, 1);

        provider.begin_round();
        let start = provider.read_global_start_counters().unwrap().energy;
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(provider.read_global_final_counters().unwrap().energy, start);

        provider.begin_round();
        let start = provider.read_global_start_counters().unwrap().energy;
        std::thread::sleep(Duration::from_millis(1));
        assert_ne!(provider.read_global_final_counters().unwrap().energy, start);
    }

    #[test]
    fn test_energy_counter_wraps_after_offset() {
        let offset = u64::from(u32::MAX) - 10;
        let provider = prepared(SimFaults { energy_offset: offset, ..Default::default() }, 1);
        provider.begin_round();

        let start = provider.read_global_start_counters().unwrap().energy.unwrap();
        assert_eq!(start, offset);
        std::thread::sleep(Duration::from_millis(1));
        let end = provider.read_global_final_counters().unwrap().energy.unwrap();
        assert!(end < start);
        assert!(end <= provider.counter_mask());
    }

    #[test]
    fn test_early_deadline_stalls_the_clock() {
        let provider = prepared(SimFaults { early_deadline_attempts: 1, ..Default::default() }, 1);
        provider.begin_round();
        let now = provider.now();
        let deadline = provider.arm_leader_deadline(CoreId(0), Duration::from_secs(4)).unwrap();
        assert!(deadline.expired(now));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(provider.now(), now);

        provider.begin_round();
        let now = provider.now();
        let deadline = provider.arm_leader_deadline(CoreId(0), Duration::from_secs(4)).unwrap();
        assert!(deadline.0 .0 - now.0 >= 4_000_000_000);
        std::thread::sleep(Duration::from_millis(2));
        assert!(provider.now().0 >= now.0 + 2_000_000);
    }

    #[test]
    fn test_clock_is_monotonic_across_attempts() {
        let provider = prepared(SimFaults { early_deadline_attempts: 1, ..Default::default() }, 1);
        let before = provider.now();
        provider.begin_round();
        let stalled = provider.now();
        provider.begin_round();
        assert!(stalled >= before);
        assert!(provider.now() >= stalled);
    }

    #[test]
    fn test_spurious_wakes_are_bounded() {
        let faults = SimFaults {
            spurious: Some(SpuriousFault { core: CoreId(1), wakes: 3, attempts: 1 }),
            ..Default::default()
        };
        let provider = prepared(faults, 2);
        provider.begin_round();

        let stop = StopFlag::new();
        stop.arm();
        let ctx = SleepContext {
            core: CoreId(1),
            mechanism: EntryMechanism::HaltWait,
            deadline: None,
            stop: &stop,
        };
        assert_eq!(provider.sleep_once(&ctx), Wake::Spurious);
        // Still delivered when the core only gets to run after the stop
        stop.stop();
        for _ in 0..2 {
            assert_eq!(provider.sleep_once(&ctx), Wake::Spurious);
        }
        assert_eq!(provider.sleep_once(&ctx), Wake::Signaled);
    }

    #[test]
    fn test_failing_local_reads() {
        let provider =
            prepared(SimFaults { failing_local_reads: Some(CoreId(1)), ..Default::default() }, 2);
        assert!(provider.read_local_start_counters(CoreId(0)).is_ok());
        assert!(matches!(
            provider.read_local_final_counters(CoreId(1)),
            Err(ProviderError::Injected(CoreId(1)))
        ));
    }
}
