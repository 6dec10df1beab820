//! Overflow-safe counter deltas
//!
//! Accumulating hardware counters are unsigned and narrower than 64 bits
//! (RAPL energy status is 32 bits). A counter that rolls over between the
//! start and final read yields `final < start`; the true delta is then
//! `final + (mask + 1) - start`.

use idlescope_common::{CoreResidency, PackageResidency};

/// Difference between two reads of one accumulating counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub value: u64,
    /// The counter rolled over between the two reads
    pub wrapped: bool,
}

/// Delta between `start` and `final_value` of a counter that wraps at `mask`
///
/// Both reads are masked first, so the result is always `<= mask`.
pub fn counter_delta(start: u64, final_value: u64, mask: u64) -> CounterDelta {
    let start = start & mask;
    let final_value = final_value & mask;

    if final_value >= start {
        CounterDelta { value: final_value - start, wrapped: false }
    } else {
        // mask + 1 may overflow for a full 64-bit mask; wrapping arithmetic
        // gives the same residue
        let value = final_value.wrapping_add(mask.wrapping_add(1)).wrapping_sub(start);
        CounterDelta { value, wrapped: true }
    }
}

/// Deltas of free-running 64-bit residency counters
pub fn package_residency_delta(
    start: Option<PackageResidency>,
    final_value: Option<PackageResidency>,
) -> Option<PackageResidency> {
    let (s, f) = (start?, final_value?);
    Some(PackageResidency {
        c2: f.c2.wrapping_sub(s.c2),
        c3: f.c3.wrapping_sub(s.c3),
        c6: f.c6.wrapping_sub(s.c6),
        c7: f.c7.wrapping_sub(s.c7),
    })
}

pub fn core_residency_delta(
    start: Option<CoreResidency>,
    final_value: Option<CoreResidency>,
) -> Option<CoreResidency> {
    let (s, f) = (start?, final_value?);
    Some(CoreResidency {
        c3: f.c3.wrapping_sub(s.c3),
        c6: f.c6.wrapping_sub(s.c6),
        c7: f.c7.wrapping_sub(s.c7),
    })
}
