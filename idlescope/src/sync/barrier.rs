//! Rendezvous barrier for one measurement round
//!
//! All participants share one monotonically increasing counter. Each phase is
//! a target value; a participant passes a phase once the counter is at least
//! that value. Waiting is a pure spin: participants run pinned with their
//! signals blocked and must never yield inside the timed section.
//!
//! ```text
//! counter:  0 ──(every core arrives)──▶ N ──(leader set up + armed)──▶ N+1 ──(each follower armed)──▶ 2N
//!                        │                          │                                  │
//!                 Phase::Arrived             Phase::LeaderReady                  Phase::Release
//!              leader may set up       followers may read the published    everyone enters the
//!                                        start timestamp and deadline        sleep/poll loop
//! ```
//!
//! Every follower increments once after its own local setup, so the release
//! target is `N + 1 + (N - 1) = 2N`: nobody starts sleeping before every
//! follower has armed its wake source.
//!
//! Comparisons are "greater or equal", so a straggler that checks late still
//! passes every phase it is entitled to, and no phase can be observed before
//! the counter reached its value.

use std::sync::atomic::{AtomicU32, Ordering};

/// Checkpoints of one round, relative to the number of participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Every participant has arrived (`count >= N`)
    Arrived,
    /// The leader has published the start timestamp and deadline (`count >= N + 1`)
    LeaderReady,
    /// Every follower finished its local setup, sleeping may begin (`count >= 2N`)
    Release,
}

#[derive(Debug)]
pub struct RendezvousBarrier {
    counter: AtomicU32,
    parties: u32,
}

impl RendezvousBarrier {
    /// Create a barrier for `parties` participants (at least one)
    pub fn new(parties: u32) -> Self {
        assert!(parties > 0, "A barrier needs at least one participant");
        Self { counter: AtomicU32::new(0), parties }
    }

    pub fn parties(&self) -> u32 {
        self.parties
    }

    /// Counter value at which `phase` is reached
    pub fn target(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Arrived => self.parties,
            Phase::LeaderReady => self.parties + 1,
            Phase::Release => 2 * self.parties,
        }
    }

    /// Announce arrival (increment) and spin until every participant arrived
    pub fn arrive(&self) {
        self.advance();
        self.wait_for(Phase::Arrived);
    }

    /// Increment the counter, publishing every write made before the call
    pub fn advance(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Spin until `phase` is reached; returns the counter value observed
    pub fn wait_for(&self, phase: Phase) -> u32 {
        self.wait_for_count(self.target(phase))
    }

    /// Spin until the counter is at least `target`
    pub fn wait_for_count(&self, target: u32) -> u32 {
        loop {
            let seen = self.counter.load(Ordering::Acquire);
            if seen >= target {
                return seen;
            }
            std::hint::spin_loop();
        }
    }

    /// Whether `phase` has been reached, without waiting
    pub fn reached(&self, phase: Phase) -> bool {
        self.count() >= self.target(phase)
    }

    pub fn count(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    /// Rewind to zero; only valid while no participant is inside the round
    pub fn reset(&self) {
        self.counter.store(0, Ordering::Release);
    }
}
