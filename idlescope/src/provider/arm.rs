//! aarch64 provider: generic timer timestamps and per-core deadlines
//!
//! Every core programs its own wakeup from the shared virtual counter, so a
//! follower ends its sleep on its own deadline instead of waiting for the
//! leader's stop broadcast. No energy or residency counters are exposed to
//! user space. Only POLL and halt-wait (WFI) exist on this architecture.

#![allow(unsafe_code)] // system register reads

use std::arch::asm;
use std::time::Duration;

use log::info;

use super::{CounterProvider, DeadlineToken, GlobalCounters, LocalCounters, SleepContext, Wake};
use crate::config::MeasurementConfig;
use crate::domain::{ConfigError, CoreId, EntryMechanism, Nanos, ProviderError, Ticks};
use crate::platform::cpuidle::{IdleStateLimiter, SYSFS_CPU_ROOT};

fn cntvct() -> u64 {
    let value: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on Linux
    unsafe { asm!("isb", "mrs {}, cntvct_el0", out(reg) value, options(nomem, nostack)) };
    value
}

fn cntfrq() -> u64 {
    let value: u64;
    // SAFETY: CNTFRQ_EL0 is readable from EL0
    unsafe { asm!("mrs {}, cntfrq_el0", out(reg) value, options(nomem, nostack)) };
    value
}

#[derive(Debug)]
pub struct ArmProvider {
    /// Generic timer frequency in Hz
    frequency: u64,
    idle_limiter: Option<IdleStateLimiter>,
}

impl ArmProvider {
    pub fn new() -> Result<Self, ProviderError> {
        let frequency = cntfrq();
        if frequency == 0 {
            return Err(ProviderError::Unsupported("arm (CNTFRQ_EL0 reads zero)"));
        }
        info!("Generic timer frequency: {frequency} Hz");
        Ok(Self { frequency, idle_limiter: None })
    }
}

/// Reject entry mechanisms the architecture has no primitive for
fn check_mechanism(cfg: &MeasurementConfig) -> Result<(), ConfigError> {
    match cfg.requested_mechanism() {
        EntryMechanism::IoPort | EntryMechanism::Unknown => {
            Err(ConfigError::UnknownMechanism(cfg.requested_mechanism().as_str().to_string()))
        }
        EntryMechanism::Poll | EntryMechanism::HaltWait => Ok(()),
    }
}

impl CounterProvider for ArmProvider {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn prepare(&mut self, cfg: &MeasurementConfig) -> Result<(), ProviderError> {
        check_mechanism(cfg)?;
        if let Some(state) = cfg.idle_state() {
            self.idle_limiter = Some(IdleStateLimiter::apply(SYSFS_CPU_ROOT, cfg.cpus(), state)?);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(mut limiter) = self.idle_limiter.take() {
            limiter.restore();
        }
    }

    fn now(&self) -> Ticks {
        Ticks(cntvct())
    }

    fn ticks_to_ns(&self, ticks: Ticks) -> Nanos {
        let ns = u128::from(ticks.0) * 1_000_000_000 / u128::from(self.frequency);
        Nanos(u64::try_from(ns).unwrap_or(u64::MAX))
    }

    fn ns_to_ticks(&self, ns: Nanos) -> Ticks {
        let ticks = u128::from(ns.0) * u128::from(self.frequency) / 1_000_000_000;
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    fn read_global_start_counters(&self) -> Result<GlobalCounters, ProviderError> {
        Ok(GlobalCounters::default())
    }

    fn read_global_final_counters(&self) -> Result<GlobalCounters, ProviderError> {
        Ok(GlobalCounters::default())
    }

    fn read_local_start_counters(&self, _core: CoreId) -> Result<LocalCounters, ProviderError> {
        Ok(LocalCounters::default())
    }

    fn read_local_final_counters(&self, _core: CoreId) -> Result<LocalCounters, ProviderError> {
        Ok(LocalCounters::default())
    }

    fn arm_follower_wakeup(
        &self,
        _core: CoreId,
        duration: Duration,
    ) -> Result<Option<DeadlineToken>, ProviderError> {
        let ticks = self.ns_to_ticks(duration.into());
        Ok(Some(DeadlineToken(Ticks(self.now().0.saturating_add(ticks.0)))))
    }

    fn sleep_once(&self, ctx: &SleepContext<'_>) -> Wake {
        self.halt_wait(ctx)
    }
}
