//! # Reference counted load/unload state machine
//!
//! [`AssetLifecycle`] decides when the load and unload side effects of some
//! shared resource may run, and counts the holders referencing it. The whole
//! state is one `AtomicU32`, changed only by CAS:
//!
//! ```text
//!                load()                     (side effect done)
//!   ┌──────────┐ ─────▶ ┌─────────┐ ────────────────────────────▶ ┌──────────────┐
//!   │ Unloaded │        │ Loading │                               │ Unreferenced │
//!   └──────────┘ ◀───── └─────────┘ ◀─┐                           └──────────────┘
//!        ▲        (load failed)        │ ┌─────────────────┐ ◀──add/remove ref─▶ │
//!        │                             │ │  Referenced(n)  │                     │
//!        │       (side effect done)    │ └─────────────────┘                     │
//!        │     ┌───────────┐  unload() │                                         │
//!        └──── │ Unloading │ ◀─────────┴─────────────────────────────────────────┘
//!              └───────────┘
//! ```
//!
//! A caller asking for a transition that another thread is already performing
//! is told so with a `Skipped` outcome. A caller asking for a transition that
//! must not race with the one in progress (load during Unloading, unload or
//! add_reference during Loading) backs off and re-reads until it settles.

use crate::{
    logging::{debug, trace, warn},
    sync::{
        Backoff,
        atomic::{AtomicU32, Ordering},
    },
};
use core::{convert::Infallible, fmt::Debug};

/// The largest reference count an [`AssetLifecycle`] can hold.
///
/// [`AssetLifecycle::add_reference`] on a saturated lifecycle does nothing.
pub const MAX_REF_COUNT: u32 = u32::MAX - 3;

const UNREFERENCED: u32 = 0;
const UNLOADING: u32 = u32::MAX - 2;
const LOADING: u32 = u32::MAX - 1;
const UNLOADED: u32 = u32::MAX;

/// A snapshot of an [`AssetLifecycle`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AssetState {
    /// Not loaded. The initial state.
    Unloaded,
    /// A thread is running the load side effect
    Loading,
    /// Loaded, and no holder references it. Eligible for unloading.
    Unreferenced,
    /// Loaded and referenced by this many holders, `1..=MAX_REF_COUNT`
    Referenced(u32),
    /// A thread is running the unload side effect
    Unloading,
}

impl AssetState {
    /// Convert the state to its packed representation.
    ///
    /// `Referenced(n)` is only valid for `n` in `1..=MAX_REF_COUNT`: a count of
    /// zero packs to Unreferenced and anything above the limit collides with a
    /// transition sentinel. Debug builds panic on such a count.
    pub const fn into_u32(self) -> u32 {
        match self {
            AssetState::Unloaded => UNLOADED,
            AssetState::Loading => LOADING,
            AssetState::Unloading => UNLOADING,
            AssetState::Unreferenced => UNREFERENCED,
            AssetState::Referenced(n) => {
                debug_assert!(
                    n != 0 && n <= MAX_REF_COUNT,
                    "reference count out of range"
                );
                n
            }
        }
    }

    /// Convert a packed state word to a state.
    ///
    /// Every `u32` is a valid state word.
    pub const fn from_u32(value: u32) -> Self {
        match value {
            UNLOADED => AssetState::Unloaded,
            LOADING => AssetState::Loading,
            UNLOADING => AssetState::Unloading,
            UNREFERENCED => AssetState::Unreferenced,
            n => AssetState::Referenced(n),
        }
    }

    /// Is the asset loaded, i.e. Unreferenced or Referenced?
    pub const fn is_loaded(self) -> bool {
        matches!(self, AssetState::Unreferenced | AssetState::Referenced(_))
    }
}

/// Result of [`AssetLifecycle::load`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[must_use]
pub enum LoadOutcome {
    /// This call ran the load side effect
    Completed,
    /// The asset was already loading or loaded, nothing was run
    Skipped,
}

/// Result of [`AssetLifecycle::unload`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[must_use]
pub enum UnloadOutcome {
    /// This call ran the unload side effect
    Completed,
    /// The asset was referenced, unloading or not loaded, nothing was run
    Skipped,
}

/// The lifecycle state of one shared, loadable resource.
///
/// Owned by whoever owns the resource and shared by reference; there is no
/// global registry.
pub struct AssetLifecycle {
    state: AtomicU32,
}

/// Puts `restore` back into `state` if a side effect unwinds mid-transition
struct RollbackOnUnwind<'a> {
    state: &'a AtomicU32,
    restore: u32,
}

impl Drop for RollbackOnUnwind<'_> {
    fn drop(&mut self) {
        warn!(
            "lifecycle: side effect did not complete, restoring {:?}",
            AssetState::from_u32(self.restore)
        );
        self.state.store(self.restore, Ordering::Release);
    }
}

impl AssetLifecycle {
    /// Create a new lifecycle in [`AssetState::Unloaded`]
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOADED),
        }
    }

    /// Create a new lifecycle in [`AssetState::Unloaded`]
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOADED),
        }
    }

    /// Create a lifecycle starting in an arbitrary state
    #[cfg(any(test, feature = "std"))]
    pub(crate) fn starting_in(state: AssetState) -> Self {
        Self {
            state: AtomicU32::new(state.into_u32()),
        }
    }

    /// Load the asset, running `load` if this call performs the transition.
    ///
    /// Returns [`LoadOutcome::Skipped`] without running `load` if the asset is
    /// already loading or loaded. Waits while another thread is unloading.
    ///
    /// Once `load` returns, the asset is Unreferenced, and everything `load`
    /// wrote is visible to any thread that observes the new state.
    pub fn load(&self, load: impl FnOnce()) -> LoadOutcome {
        match self.try_load(|| {
            load();
            Ok::<(), Infallible>(())
        }) {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Like [`Self::load`], for a fallible side effect.
    ///
    /// If `load` fails, the asset goes back to Unloaded and the error is
    /// returned. Another caller may then retry.
    pub fn try_load<E>(&self, load: impl FnOnce() -> Result<(), E>) -> Result<LoadOutcome, E> {
        let mut backoff = Backoff::new();
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            match current {
                UNLOADED => {}
                UNLOADING => {
                    trace!("lifecycle: load() waits for unload");
                    backoff.spin();
                    current = self.state.load(Ordering::Acquire);
                    continue;
                }
                _ => {
                    trace!("lifecycle: load() skipped in {:?}", AssetState::from_u32(current));
                    return Ok(LoadOutcome::Skipped);
                }
            }

            // Acquire: see the unload side effect of whoever unloaded last
            match self.state.compare_exchange(
                UNLOADED,
                LOADING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let guard = RollbackOnUnwind {
            state: &self.state,
            restore: UNLOADED,
        };
        let res = load();
        core::mem::forget(guard);

        match res {
            Ok(()) => {
                // Release: publish the load side effect
                self.state.store(UNREFERENCED, Ordering::Release);
                debug!("lifecycle: load completed");
                Ok(LoadOutcome::Completed)
            }
            Err(e) => {
                self.state.store(UNLOADED, Ordering::Release);
                warn!("lifecycle: load failed, back to Unloaded");
                Err(e)
            }
        }
    }

    /// Unload the asset, running `unload` if this call performs the transition.
    ///
    /// Only an Unreferenced asset is unloaded. Returns
    /// [`UnloadOutcome::Skipped`] without running `unload` if the asset is
    /// referenced, unloading or unloaded. Waits while another thread is loading.
    pub fn unload(&self, unload: impl FnOnce()) -> UnloadOutcome {
        let mut backoff = Backoff::new();
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            match current {
                UNREFERENCED => {}
                LOADING => {
                    trace!("lifecycle: unload() waits for load");
                    backoff.spin();
                    current = self.state.load(Ordering::Acquire);
                    continue;
                }
                _ => {
                    trace!("lifecycle: unload() skipped in {:?}", AssetState::from_u32(current));
                    return UnloadOutcome::Skipped;
                }
            }

            match self.state.compare_exchange(
                UNREFERENCED,
                UNLOADING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let guard = RollbackOnUnwind {
            state: &self.state,
            restore: UNREFERENCED,
        };
        unload();
        core::mem::forget(guard);

        self.state.store(UNLOADED, Ordering::Release);
        debug!("lifecycle: unload completed");
        UnloadOutcome::Completed
    }

    /// Register one more holder of the asset.
    ///
    /// Waits while the asset is loading. Does nothing if it is unloading or
    /// unloaded, or if the count is already at [`MAX_REF_COUNT`].
    pub fn add_reference(&self) {
        let mut backoff = Backoff::new();
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            match current {
                LOADING => {
                    backoff.spin();
                    current = self.state.load(Ordering::Acquire);
                    continue;
                }
                UNLOADING | UNLOADED => {
                    trace!("lifecycle: add_reference() on an unloaded asset");
                    return;
                }
                MAX_REF_COUNT => {
                    trace!("lifecycle: reference count saturated");
                    return;
                }
                _ => {}
            }

            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Drop one holder of the asset.
    ///
    /// Does nothing unless the asset is Referenced.
    pub fn remove_reference(&self) {
        let mut backoff = Backoff::new();
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            if matches!(current, UNREFERENCED | UNLOADING | LOADING | UNLOADED) {
                return;
            }

            match self.state.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Returns the current state.
    ///
    /// Diagnostic only: the state may change right after it is read.
    pub fn current_state(&self) -> AssetState {
        AssetState::from_u32(self.state.load(Ordering::Acquire))
    }
}

impl Default for AssetLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for AssetLifecycle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AssetLifecycle")
            .field(&self.current_state())
            .finish()
    }
}
