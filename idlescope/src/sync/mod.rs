//! Lock-free coordination primitives for pinned, non-yielding participants

pub mod barrier;
pub mod stop;

pub use barrier::{Phase, RendezvousBarrier};
pub use stop::StopFlag;
