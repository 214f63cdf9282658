//! Backing stores for [`ObjectPool`](crate::pool::ObjectPool) growth
//!
//! The pool only talks to its store when it is constructed, when the free list
//! runs dry in `create`, and when it is torn down. The lock-free hot paths
//! never allocate or release.

use crate::error::Error;
use core::{alloc::Layout, ptr::NonNull};

/// A source of item-sized memory for an object pool.
pub trait BackingStore {
    /// Allocate memory fitting `layout`.
    ///
    /// May block, depending on the implementation. Must return
    /// [`Error::AllocationFailure`] rather than abort when the request cannot
    /// be satisfied.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error>;

    /// Give memory back to the store.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::allocate`] on this store with
    /// the same `layout`, and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

impl<S: BackingStore + ?Sized> BackingStore for &S {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        S::allocate(self, layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded caller contract
        unsafe { S::release(self, ptr, layout) }
    }
}

/// The global allocator
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalStore;

impl BackingStore for GlobalStore {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        if layout.size() == 0 {
            return Err(Error::InvalidLayout {
                size: 0,
                align: layout.align(),
            });
        }
        // SAFETY: `layout` has a non-zero size
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(Error::AllocationFailure {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees `ptr` came from `allocate` with `layout`
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
