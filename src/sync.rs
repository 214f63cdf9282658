#[cfg(loom)]
use loom::sync;

#[cfg(all(not(loom), not(feature = "std")))]
use core::sync;

#[cfg(all(not(loom), feature = "std"))]
use std::sync;

pub mod atomic {
    pub use super::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
}

/// Exponential backoff for CAS retry loops.
///
/// Spins `2^step` times per call until `SPIN_LIMIT`, after which it yields the
/// thread (with `std`) or keeps spinning at the cap (without). Under loom every
/// call is a `yield_now` so the model can schedule the thread we are waiting on.
#[derive(Debug)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    #[cfg(not(loom))]
    const SPIN_LIMIT: u32 = 6;
    #[cfg(not(loom))]
    const YIELD_LIMIT: u32 = 10;

    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    #[cfg(loom)]
    pub(crate) fn spin(&mut self) {
        self.step = self.step.saturating_add(1);
        loom::thread::yield_now();
    }

    #[cfg(not(loom))]
    pub(crate) fn spin(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else {
            #[cfg(feature = "std")]
            std::thread::yield_now();

            #[cfg(not(feature = "std"))]
            for _ in 0..(1u32 << Self::SPIN_LIMIT) {
                core::hint::spin_loop();
            }
        }

        if self.step <= Self::YIELD_LIMIT {
            self.step += 1;
        }
    }
}
