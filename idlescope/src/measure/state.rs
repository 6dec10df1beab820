//! Round state
//!
//! [`SharedRoundState`] is the one structure every per-core task of a round
//! borrows. The rendezvous counter is the only field that orders anything;
//! the other fields are written once by the leader before it advances the
//! barrier and only read by followers after they observed that phase, so
//! relaxed atomics are enough for them.
//!
//! [`CoreRoundState`] is owned by its core's thread for the whole round and
//! handed back through the join.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::domain::{CoreId, Ticks};
use crate::provider::{DeadlineToken, GlobalCounters, LocalCounters};
use crate::sync::{RendezvousBarrier, StopFlag};

#[derive(Debug)]
pub struct SharedRoundState {
    pub barrier: RendezvousBarrier,
    pub stop: StopFlag,
    start: AtomicU64,
    deadline: AtomicU64,
    /// Leader timestamp taken right before the stop broadcast
    trigger: AtomicU64,
    end: AtomicU64,
    corrupted: AtomicBool,
}

impl SharedRoundState {
    pub fn new(parties: u32) -> Self {
        Self {
            barrier: RendezvousBarrier::new(parties),
            stop: StopFlag::new(),
            start: AtomicU64::new(0),
            deadline: AtomicU64::new(u64::MAX),
            trigger: AtomicU64::new(0),
            end: AtomicU64::new(0),
            corrupted: AtomicBool::new(false),
        }
    }

    /// Prepare for a new attempt. Only called while no core task runs.
    ///
    /// The deadline starts at "never" so a polling core that reaches its
    /// loop early does not see an expired deadline.
    pub fn reset(&self) {
        self.barrier.reset();
        self.start.store(0, Ordering::Relaxed);
        self.deadline.store(u64::MAX, Ordering::Relaxed);
        self.trigger.store(0, Ordering::Relaxed);
        self.end.store(0, Ordering::Relaxed);
        self.corrupted.store(false, Ordering::Relaxed);
        self.stop.arm();
    }

    pub fn publish_start(&self, ticks: Ticks) {
        self.start.store(ticks.0, Ordering::Relaxed);
    }

    pub fn start(&self) -> Ticks {
        Ticks(self.start.load(Ordering::Relaxed))
    }

    pub fn publish_deadline(&self, deadline: DeadlineToken) {
        self.deadline.store(deadline.0 .0, Ordering::Relaxed);
    }

    pub fn deadline(&self) -> DeadlineToken {
        DeadlineToken(Ticks(self.deadline.load(Ordering::Relaxed)))
    }

    pub fn publish_trigger(&self, ticks: Ticks) {
        self.trigger.store(ticks.0, Ordering::Relaxed);
    }

    pub fn trigger(&self) -> Ticks {
        Ticks(self.trigger.load(Ordering::Relaxed))
    }

    pub fn publish_end(&self, ticks: Ticks) {
        self.end.store(ticks.0, Ordering::Relaxed);
    }

    pub fn end(&self) -> Ticks {
        Ticks(self.end.load(Ordering::Relaxed))
    }

    /// Flag the attempt as corrupted; idempotent
    pub fn mark_corrupted(&self) {
        self.corrupted.store(true, Ordering::Relaxed);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Relaxed)
    }
}

/// What one core recorded during one attempt
#[derive(Debug, Clone, Default)]
pub struct CoreRoundState {
    pub core: CoreId,
    /// Armed for the whole attempt, cleared by the core once it left its loop
    pub trigger: bool,
    pub start: LocalCounters,
    pub final_counters: LocalCounters,
    /// Deadline this core armed for itself, if the provider needed one
    pub local_deadline: Option<DeadlineToken>,
    pub wakeup: Ticks,
    pub wakeups: u64,
    pub spurious_wakeups: u64,
    /// Left the loop before the leader ended the measurement
    pub left_early: bool,
    pub hardware_faults: u32,
}

impl CoreRoundState {
    pub fn armed(core: CoreId) -> Self {
        Self { core, trigger: true, ..Self::default() }
    }
}

/// Leader-only view of the package-wide part of an attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaderRecord {
    pub global_start: GlobalCounters,
    pub global_final: GlobalCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_restores_never_deadline() {
        let shared = SharedRoundState::new(2);
        shared.publish_deadline(DeadlineToken(Ticks(42)));
        shared.mark_corrupted();
        shared.barrier.advance();

        shared.reset();

        assert_eq!(shared.deadline(), DeadlineToken::NEVER);
        assert!(!shared.is_corrupted());
        assert_eq!(shared.barrier.count(), 0);
        assert!(shared.stop.is_ongoing());
    }

    #[test]
    fn test_armed_core_state() {
        let state = CoreRoundState::armed(CoreId(3));
        assert!(state.trigger);
        assert_eq!(state.core, CoreId(3));
        assert_eq!(state.wakeups, 0);
    }
}
