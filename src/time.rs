//! Tick-based time, the way `r3_core::time` represents durations - except
//! KrisOS only ever needs a single monotonic tick count (the core never
//! exposes wall-clock time to applications), so there is no wraparound-safe
//! "system time vs. event time" split here.

use core::ops::{Add, Sub};

/// A duration or absolute point in time, expressed as a count of kernel
/// ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Ticks(pub u64);

/// A deadline that never arrives - used for `sleep(FOREVER)` and for waits
/// with no timeout.
pub const FOREVER: Ticks = Ticks(u64::MAX);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    #[inline]
    pub const fn is_forever(self) -> bool {
        self.0 == FOREVER.0
    }

    #[inline]
    pub const fn saturating_add(self, rhs: Ticks) -> Ticks {
        if self.is_forever() || rhs.is_forever() {
            FOREVER
        } else {
            Ticks(self.0.saturating_add(rhs.0))
        }
    }
}

impl Add for Ticks {
    type Output = Ticks;
    fn add(self, rhs: Ticks) -> Ticks {
        self.saturating_add(rhs)
    }
}

impl Sub for Ticks {
    type Output = Ticks;
    fn sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}
