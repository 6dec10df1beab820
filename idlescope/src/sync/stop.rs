//! The "measurement ongoing" word
//!
//! Sleeping cores block on this word; the leader clears it once the deadline
//! passed and wakes everyone. The word sits alone in its cache lines so that
//! no unrelated write can wake a core monitoring it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::platform::futex::{self, WaitOutcome};

const ONGOING: u32 = 1;
const STOPPED: u32 = 0;

#[repr(align(128))]
#[derive(Debug)]
pub struct StopFlag {
    word: AtomicU32,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    /// A flag in the stopped state
    pub const fn new() -> Self {
        Self { word: AtomicU32::new(STOPPED) }
    }

    /// Mark a round as ongoing; called before any core is dispatched
    pub fn arm(&self) {
        self.word.store(ONGOING, Ordering::Release);
    }

    pub fn is_ongoing(&self) -> bool {
        self.word.load(Ordering::Acquire) == ONGOING
    }

    /// Clear the word. Returns false if it was already cleared.
    pub fn stop(&self) -> bool {
        self.word.swap(STOPPED, Ordering::AcqRel) == ONGOING
    }

    /// Block while the round is ongoing, for at most `timeout`
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        futex::wait(&self.word, ONGOING, timeout)
    }

    /// Wake every core blocked in [`StopFlag::wait`]
    pub fn wake_all(&self) {
        futex::wake_all(&self.word);
    }
}
