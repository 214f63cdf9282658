//! Test utilities - NOT covered by semver guarantees

#![allow(clippy::unwrap_used)]

use core::{alloc::Layout, ptr::NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};

use crate::{
    error::Error,
    handle::SlotIndex,
    lifecycle::{AssetLifecycle, AssetState},
    store::{BackingStore, GlobalStore},
    sync::atomic::AtomicU32,
};

/// A link table with `len` unlinked slots, for driving a
/// [`NonBlockingList`](crate::list::NonBlockingList) directly.
pub fn link_table(len: usize) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(0)).collect()
}

/// Shorthand for a known-valid [`SlotIndex`]
pub fn slot(index: u32) -> SlotIndex {
    SlotIndex::new(index).unwrap()
}

/// A lifecycle starting in `state`, e.g. to test saturation without
/// `MAX_REF_COUNT` calls to `add_reference`.
///
/// `Referenced(n)` must have `n` in `1..=MAX_REF_COUNT`, debug builds panic
/// otherwise.
pub fn lifecycle_in_state(state: AssetState) -> AssetLifecycle {
    AssetLifecycle::starting_in(state)
}

/// A [`BackingStore`] that refuses every request from the `fail_index`-th on
/// (counting from zero), and forwards the rest to the global allocator.
#[derive(Debug)]
pub struct FailingStore {
    fail_index: usize,
    requests: AtomicUsize,
}

impl FailingStore {
    pub fn new(fail_index: usize) -> Self {
        Self {
            fail_index,
            requests: AtomicUsize::new(0),
        }
    }

    /// Number of allocation requests seen so far, failed ones included
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

impl BackingStore for FailingStore {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let n = self.requests.fetch_add(1, Ordering::Relaxed);
        if n >= self.fail_index {
            warn!("FailingStore: refusing request #{}", n);
            return Err(Error::AllocationFailure {
                size: layout.size(),
                align: layout.align(),
            });
        }
        GlobalStore.allocate(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: everything handed out came from `GlobalStore`
        unsafe { GlobalStore.release(ptr, layout) }
    }
}

/// A [`BackingStore`] wrapper that counts live and total allocations, and
/// checks that every release matches an allocation's layout and alignment.
#[derive(Debug)]
pub struct CountingStore<S = GlobalStore> {
    inner: S,
    live: AtomicUsize,
    total: AtomicUsize,
}

impl<S: BackingStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            live: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    /// Allocations not yet released
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Successful allocations ever made
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }
}

impl Default for CountingStore<GlobalStore> {
    fn default() -> Self {
        Self::new(GlobalStore)
    }
}

impl<S: BackingStore> BackingStore for CountingStore<S> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        let ptr = self.inner.allocate(layout)?;
        assert_eq!(
            ptr.as_ptr() as usize % layout.align(),
            0,
            "store returned misaligned memory"
        );
        self.live.fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::AcqRel);
        Ok(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "released more than was allocated");
        // SAFETY: forwarded caller contract
        unsafe { self.inner.release(ptr, layout) }
    }
}

/// Records lifecycle side effects as they run, and panics the moment two of
/// them overlap or they stop alternating.
///
/// Hand [`Self::enter_load`] / [`Self::enter_unload`] to
/// [`AssetLifecycle::load`] / [`AssetLifecycle::unload`] as (part of) the side
/// effect.
#[derive(Debug, Default)]
pub struct TransitionLedger {
    /// Loads minus unloads, including the one currently running
    outstanding: AtomicUsize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl TransitionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_load(&self) {
        let prev = self.outstanding.fetch_add(1, Ordering::AcqRel);
        assert_eq!(prev, 0, "load side effect ran while loaded or loading");
        let n = self.loads.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("ledger: load #{}", n);
    }

    pub fn enter_unload(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert_eq!(prev, 1, "unload side effect ran while not loaded");
        let n = self.unloads.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("ledger: unload #{}", n);
    }

    pub fn completed_loads(&self) -> usize {
        self.loads.load(Ordering::Acquire)
    }

    pub fn completed_unloads(&self) -> usize {
        self.unloads.load(Ordering::Acquire)
    }

    /// Completed loads minus completed unloads. Always 0 or 1.
    pub fn balance(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}
