//! # Lock-free object pool
//!
//! [`ObjectPool`] hands out item-sized, item-aligned chunks of memory and
//! recycles them through a [`NonBlockingList`] of free slots. When the free
//! list is empty, `create` grows the pool by one slot from the
//! [`BackingStore`]; this growth path is the only one that takes a lock or
//! touches the allocator.
//!
//! ## Slot directory
//!
//! Slots are addressed by [`SlotIndex`]. The directory is a fixed array of
//! lazily allocated segments, segment `k` holding `32 << k` slots:
//!
//! ```text
//! segments[0] ──▶ [ slot 0 .. slot 31 ]
//! segments[1] ──▶ [ slot 32 .. slot 95 ]
//! segments[2] ──▶ [ slot 96 .. slot 223 ]
//!     ...
//! ```
//!
//! Every slot holds the pointer to its item memory and the free list link for
//! that slot. Segments are published once and never move or get freed until
//! the pool is dropped, so any thread holding a slot index can look the slot
//! up without a lock.

use crate::{
    error::Error,
    handle::SlotIndex,
    list::{LinkTable, NonBlockingList},
    logging::{debug, error, trace},
    store::{BackingStore, GlobalStore},
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};
use alloc::boxed::Box;
use core::{
    alloc::Layout,
    fmt::Debug,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr::{self, NonNull},
};
use mutex::BlockingMutex;
use mutex_traits::{ConstInit, ScopedRawMutex};

/// Number of slots in the first directory segment
const FIRST_SEGMENT_LEN: u32 = 32;
/// Number of directory segments
const SEGMENT_COUNT: usize = 26;

/// The maximum number of slots a single pool can ever allocate
pub const MAX_SLOTS: u32 = FIRST_SEGMENT_LEN * ((1 << SEGMENT_COUNT) - 1);

// Every slot index the directory can address must fit a `TaggedHandle`
const _: () = assert!(MAX_SLOTS - 1 <= SlotIndex::MAX);

/// Construction parameters of an [`ObjectPool`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolConfig {
    /// Number of slots allocated up front and placed on the free list
    pub capacity: usize,
    /// Alignment of every item. `None` uses the natural alignment of `T`; a
    /// smaller value than the natural alignment has no effect.
    pub alignment: Option<usize>,
}

impl PoolConfig {
    /// Default config: no pre-allocated slots, natural alignment
    pub const fn new() -> Self {
        Self {
            capacity: 0,
            alignment: None,
        }
    }

    /// Pre-allocate `capacity` slots at construction
    pub const fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Over-align every item to `alignment` bytes
    pub const fn with_alignment(self, alignment: usize) -> Self {
        Self {
            alignment: Some(alignment),
            ..self
        }
    }
}

/// A typed, growable, lock-free pool of `T`-sized items.
///
/// * `R` is the raw mutex guarding growth, e.g.
///   [`CriticalSectionRawMutex`](mutex::raw_impls::cs::CriticalSectionRawMutex).
/// * `S` is the [`BackingStore`] that item memory comes from.
///
/// Items are handed out as [`PoolItem`]s, which borrow the pool. This means the
/// pool cannot be dropped (and its memory released) while any item is alive.
///
/// The pool never runs `T`'s destructor and never shrinks: memory obtained from
/// the store is only returned when the pool is dropped.
pub struct ObjectPool<T, R: ScopedRawMutex, S: BackingStore = GlobalStore> {
    free: NonBlockingList,
    slots: SlotDirectory<T>,
    /// Serializes slot allocation. Holds the number of slots allocated so far.
    growth: BlockingMutex<R, u32>,
    layout: Layout,
    store: S,
}

/// A single item handed out by [`ObjectPool::create`].
///
/// The memory is uninitialized when first created, and holds whatever the
/// previous owner left behind when recycled. The pool never drops a `T`, so
/// writing over an old value without [`assume_init_drop`](Self::assume_init_drop)
/// leaks it.
pub struct PoolItem<'pool, T> {
    slot: SlotIndex,
    ptr: NonNull<T>,
    _pool: PhantomData<&'pool mut T>,
}

/// One entry of the slot directory
struct Slot<T> {
    /// Item memory. Written once, before the slot index is handed out.
    item: AtomicPtr<T>,
    /// Free list link
    next: AtomicU32,
}

/// Lock-free lookup from [`SlotIndex`] to [`Slot`].
struct SlotDirectory<T> {
    segments: [AtomicPtr<Slot<T>>; SEGMENT_COUNT],
    /// Mirror of the growth counter for lock-free diagnostics
    allocated: AtomicU32,
}

// ---- impl ObjectPool ----

impl<T, R: ScopedRawMutex + ConstInit> ObjectPool<T, R, GlobalStore> {
    /// Create an empty pool backed by the global allocator
    pub fn new() -> Self {
        Self::empty(GlobalStore, natural_layout::<T>())
    }

    /// Create a pool backed by the global allocator, with `capacity` slots
    /// pre-allocated on the free list.
    pub fn with_capacity(capacity: usize) -> Result<Self, Error> {
        Self::with_config(GlobalStore, PoolConfig::new().with_capacity(capacity))
    }
}

impl<T, R: ScopedRawMutex + ConstInit> Default for ObjectPool<T, R, GlobalStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R: ScopedRawMutex + ConstInit, S: BackingStore> ObjectPool<T, R, S> {
    /// Create a pool on top of `store`.
    ///
    /// This pre-allocates `config.capacity` slots. If the store cannot satisfy
    /// all of them, every slot allocated so far is released again and
    /// [`Error::AllocationFailure`] is returned.
    ///
    /// # Example
    /// ```
    /// use mutex::raw_impls::cs::CriticalSectionRawMutex;
    /// use pool_noodle::pool::{ObjectPool, PoolConfig};
    /// use pool_noodle::store::GlobalStore;
    ///
    /// let pool: ObjectPool<[u8; 24], CriticalSectionRawMutex> = ObjectPool::with_config(
    ///     GlobalStore,
    ///     PoolConfig::new().with_capacity(16).with_alignment(64),
    /// )
    /// .unwrap();
    ///
    /// let item = pool.create().unwrap();
    /// assert_eq!(item.as_ptr().as_ptr() as usize % 64, 0);
    /// pool.destroy(item);
    /// ```
    pub fn with_config(store: S, config: PoolConfig) -> Result<Self, Error> {
        let layout = item_layout::<T>(config.alignment)?;
        let pool = Self::empty(store, layout);

        // On error `pool` is dropped here, which releases the partial allocation
        for _ in 0..config.capacity {
            let slot = pool.grow()?;
            pool.free.prepend(&pool.slots, slot);
        }

        debug!(
            "pool: pre-allocated {} slots of {} bytes aligned to {}",
            config.capacity,
            layout.size(),
            layout.align()
        );
        Ok(pool)
    }

    fn empty(store: S, layout: Layout) -> Self {
        Self {
            free: NonBlockingList::new(),
            slots: SlotDirectory::new(),
            growth: BlockingMutex::new(0),
            layout,
            store,
        }
    }
}

impl<T, R: ScopedRawMutex, S: BackingStore> ObjectPool<T, R, S> {
    /// Obtain an item, reusing a free slot if one is available.
    ///
    /// Only when the free list is empty does this allocate a fresh slot from
    /// the backing store. That path takes the growth lock and may block, or
    /// fail with [`Error::AllocationFailure`]; popping a free slot never does.
    pub fn create(&self) -> Result<PoolItem<'_, T>, Error> {
        let slot = match self.free.pop_first(&self.slots) {
            Some(slot) => slot,
            None => self.grow()?,
        };

        let item = self.slots.get(slot).item.load(Ordering::Acquire);
        let Some(ptr) = NonNull::new(item) else {
            unreachable!("slot {:?} was handed out before its item was allocated", slot);
        };

        Ok(PoolItem {
            slot,
            ptr,
            _pool: PhantomData,
        })
    }

    /// Put `item` back on the free list.
    ///
    /// No destructor is run. The next `create` on this pool will return this
    /// slot unless another thread gets to it first.
    ///
    /// # Panics
    ///
    /// Panics if `item` was created by a different pool.
    pub fn destroy(&self, item: PoolItem<'_, T>) {
        let owned = self.slots.try_get(item.slot).map(|s| s.item.load(Ordering::Relaxed));
        if owned != Some(item.ptr.as_ptr()) {
            panic!("destroy() called with an item of a different pool");
        }
        self.free.prepend(&self.slots, item.slot);
    }

    /// Tear the pool down, releasing all memory to the backing store.
    ///
    /// Equivalent to dropping the pool. Returns the backing store.
    pub fn deinit(self) -> S
    where
        S: Clone,
    {
        let store = self.store.clone();
        drop(self);
        store
    }

    /// Number of slots allocated from the backing store so far.
    ///
    /// As the pool never shrinks, this only ever grows.
    pub fn allocated(&self) -> usize {
        self.slots.allocated.load(Ordering::Acquire) as usize
    }

    /// Layout of each item, including any requested over-alignment
    pub fn item_layout(&self) -> Layout {
        self.layout
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Allocate one fresh slot from the backing store
    fn grow(&self) -> Result<SlotIndex, Error> {
        self.growth.with_lock(|allocated| {
            let index = *allocated;
            let exhausted = Error::AllocationFailure {
                size: self.layout.size(),
                align: self.layout.align(),
            };
            if index >= MAX_SLOTS {
                error!("pool: all {} slots are in use", MAX_SLOTS);
                return Err(exhausted);
            }
            let slot = SlotIndex::new(index).ok_or(exhausted)?;

            let item = self.store.allocate(self.layout).inspect_err(|_| {
                error!(
                    "pool: backing store refused {} bytes (after {} slots)",
                    self.layout.size(),
                    index
                );
            })?;

            self.slots.publish(slot).item.store(item.as_ptr().cast(), Ordering::Release);
            *allocated = index + 1;
            self.slots.allocated.store(index + 1, Ordering::Release);

            trace!("pool: grew to {} slots", index + 1);
            Ok(slot)
        })
    }
}

impl<T, R: ScopedRawMutex, S: BackingStore> Drop for ObjectPool<T, R, S> {
    fn drop(&mut self) {
        // No `PoolItem` can be alive here, they borrow the pool. Drain the free
        // list first so the count reflects what was reusable at the end.
        let mut free = 0usize;
        while self.free.pop_first(&self.slots).is_some() {
            free += 1;
        }

        let allocated = self.slots.allocated.load(Ordering::Acquire);
        debug!(
            "pool: deinit, releasing {} slots ({} on the free list)",
            allocated, free
        );

        for index in 0..allocated {
            let Some(slot) = SlotIndex::new(index).and_then(|s| self.slots.try_get(s)) else {
                continue;
            };
            if let Some(item) = NonNull::new(slot.item.load(Ordering::Acquire)) {
                // SAFETY: `item` was returned by `self.store.allocate(self.layout)`
                // in `grow`, and no `PoolItem` referencing it can outlive the pool.
                unsafe { self.store.release(item.cast(), self.layout) };
            }
        }
        // Segments are freed by `SlotDirectory`'s drop, after this.
    }
}

impl<T, R: ScopedRawMutex, S: BackingStore> Debug for ObjectPool<T, R, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("allocated", &self.allocated())
            .field("free", &self.free)
            .field("layout", &self.layout)
            .finish()
    }
}

// SAFETY: the pool moves `T` storage between threads (through `PoolItem`) but
// never shares a `T` itself. Growth is serialized by `R`, everything else is
// atomics.
unsafe impl<T: Send, R: ScopedRawMutex + Send, S: BackingStore + Send> Send for ObjectPool<T, R, S> {}
// SAFETY: see above
unsafe impl<T: Send, R: ScopedRawMutex + Sync, S: BackingStore + Sync> Sync for ObjectPool<T, R, S> {}

// ---- impl PoolItem ----

impl<T> PoolItem<'_, T> {
    /// The slot this item occupies in its pool
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Raw pointer to the item memory
    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// The item memory, which may or may not hold an initialized `T`
    pub fn as_uninit_mut(&mut self) -> &mut MaybeUninit<T> {
        // SAFETY: `ptr` is valid and aligned for `T`, and this item is the
        // only handle to it until it is destroyed.
        unsafe { self.ptr.cast::<MaybeUninit<T>>().as_mut() }
    }

    /// Move `value` into the item, without dropping what was there before
    pub fn write(&mut self, value: T) -> &mut T {
        self.as_uninit_mut().write(value)
    }

    /// # Safety
    ///
    /// The item must hold an initialized `T`.
    pub unsafe fn assume_init_ref(&self) -> &T {
        // SAFETY: caller guarantees initialization, see `as_uninit_mut` for
        // validity and exclusivity.
        unsafe { self.ptr.as_ref() }
    }

    /// # Safety
    ///
    /// The item must hold an initialized `T`.
    pub unsafe fn assume_init_mut(&mut self) -> &mut T {
        // SAFETY: as `assume_init_ref`
        unsafe { self.ptr.as_mut() }
    }

    /// Drop the `T` held by this item in place. The memory stays with the item.
    ///
    /// # Safety
    ///
    /// The item must hold an initialized `T`, which is uninitialized afterwards.
    pub unsafe fn assume_init_drop(&mut self) {
        // SAFETY: caller guarantees initialization
        unsafe { ptr::drop_in_place(self.ptr.as_ptr()) }
    }
}

impl<T> Debug for PoolItem<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolItem")
            .field("slot", &self.slot)
            .field("ptr", &self.ptr)
            .finish()
    }
}

// SAFETY: a `PoolItem` is the unique handle to its item memory, like a `&mut T`
unsafe impl<T: Send> Send for PoolItem<'_, T> {}
// SAFETY: shared access only ever hands out `&T`
unsafe impl<T: Sync> Sync for PoolItem<'_, T> {}

// ---- impl SlotDirectory ----

impl<T> SlotDirectory<T> {
    fn new() -> Self {
        Self {
            segments: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            allocated: AtomicU32::new(0),
        }
    }

    /// Look up a slot whose index has been handed out.
    fn get(&self, slot: SlotIndex) -> &Slot<T> {
        let Some(slot) = self.try_get(slot) else {
            unreachable!("slot {:?} used before its segment was published", slot);
        };
        slot
    }

    /// Look up a slot, returning `None` if its segment was never allocated.
    fn try_get(&self, slot: SlotIndex) -> Option<&Slot<T>> {
        let (segment, offset) = locate(slot.get());
        let base = NonNull::new(self.segments.get(segment)?.load(Ordering::Acquire))?;
        // SAFETY: published segments hold `segment_len(segment)` initialized
        // slots, `offset` is below that, and segments live as long as `self`.
        Some(unsafe { &*base.as_ptr().add(offset) })
    }

    /// Make sure the segment holding `slot` exists and return the slot.
    ///
    /// Must only be called with the growth lock held.
    fn publish(&self, slot: SlotIndex) -> &Slot<T> {
        let (segment, offset) = locate(slot.get());
        let cell = &self.segments[segment];

        let base = match NonNull::new(cell.load(Ordering::Acquire)) {
            Some(base) => base,
            None => {
                let len = segment_len(segment);
                let fresh: Box<[Slot<T>]> = (0..len).map(|_| Slot::new()).collect();
                let base = NonNull::from(Box::leak(fresh)).cast::<Slot<T>>();
                cell.store(base.as_ptr(), Ordering::Release);
                debug!("pool: allocated directory segment {} ({} slots)", segment, len);
                base
            }
        };

        // SAFETY: as in `try_get`
        unsafe { &*base.as_ptr().add(offset) }
    }
}

impl<T> LinkTable for SlotDirectory<T> {
    fn link(&self, slot: SlotIndex) -> &AtomicU32 {
        &self.get(slot).next
    }
}

impl<T> Drop for SlotDirectory<T> {
    fn drop(&mut self) {
        for (segment, cell) in self.segments.iter().enumerate() {
            let base = cell.load(Ordering::Acquire);
            if base.is_null() {
                continue;
            }
            let raw = ptr::slice_from_raw_parts_mut(base, segment_len(segment));
            // SAFETY: `raw` is exactly the boxed slice leaked in `publish`, and
            // nothing can reference it any more.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            item: AtomicPtr::new(ptr::null_mut()),
            next: AtomicU32::new(0),
        }
    }
}

// ---- helpers ----

/// Find the directory segment and the offset within it for a slot index
const fn locate(index: u32) -> (usize, usize) {
    let bucket = index / FIRST_SEGMENT_LEN + 1;
    let segment = (u32::BITS - 1 - bucket.leading_zeros()) as usize;
    let start = FIRST_SEGMENT_LEN * ((1 << segment) - 1);
    (segment, (index - start) as usize)
}

const fn segment_len(segment: usize) -> usize {
    (FIRST_SEGMENT_LEN as usize) << segment
}

/// The layout of `T`, padded to at least one byte so every slot gets a
/// distinct address.
fn natural_layout<T>() -> Layout {
    let layout = Layout::new::<T>();
    if layout.size() != 0 {
        return layout;
    }
    // SAFETY: `align_of::<T>()` is a power of two, and a size of 1 rounded up to
    // it cannot overflow `isize`.
    unsafe { Layout::from_size_align_unchecked(1, layout.align()) }
}

fn item_layout<T>(alignment: Option<usize>) -> Result<Layout, Error> {
    let natural = natural_layout::<T>();
    match alignment {
        None => Ok(natural),
        Some(align) => natural.align_to(align).map_err(|_| Error::InvalidLayout {
            size: natural.size(),
            align,
        }),
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_utils::{CountingStore, FailingStore};
    use mutex::raw_impls::cs::CriticalSectionRawMutex;
    use test_log::test;

    type Pool<T, S = GlobalStore> = ObjectPool<T, CriticalSectionRawMutex, S>;

    #[test]
    fn segment_math() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
        assert_eq!(locate(MAX_SLOTS - 1), (SEGMENT_COUNT - 1, segment_len(SEGMENT_COUNT - 1) - 1));

        let total: usize = (0..SEGMENT_COUNT).map(segment_len).sum();
        assert_eq!(total, MAX_SLOTS as usize);
    }

    #[test]
    fn layouts() {
        assert_eq!(natural_layout::<u64>(), Layout::new::<u64>());
        assert_eq!(natural_layout::<()>().size(), 1);

        let over = item_layout::<u16>(Some(128)).unwrap();
        assert_eq!((over.size(), over.align()), (2, 128));
        // Asking for less than the natural alignment keeps the natural one
        let under = item_layout::<u64>(Some(1)).unwrap();
        assert_eq!(under.align(), core::mem::align_of::<u64>());

        assert_eq!(
            item_layout::<u16>(Some(3)),
            Err(Error::InvalidLayout { size: 2, align: 3 })
        );
    }

    #[test]
    fn lifo_reuse() {
        let pool: Pool<u32> = ObjectPool::new();
        let p1 = pool.create().unwrap();
        let p2 = pool.create().unwrap();
        let p3 = pool.create().unwrap();
        assert_ne!(p1.as_ptr(), p2.as_ptr());
        assert_ne!(p2.as_ptr(), p3.as_ptr());
        assert_ne!(p1.as_ptr(), p3.as_ptr());

        let addr = p2.as_ptr();
        pool.destroy(p2);
        let p4 = pool.create().unwrap();
        assert_eq!(p4.as_ptr(), addr);
        assert_eq!(pool.allocated(), 3);

        pool.destroy(p1);
        pool.destroy(p3);
        pool.destroy(p4);
    }

    #[test]
    fn grows_across_segments() {
        let pool: Pool<u64> = ObjectPool::new();
        let mut items: Vec<_> = (0..200).map(|_| pool.create().unwrap()).collect();
        for (i, item) in items.iter_mut().enumerate() {
            item.write(i as u64);
        }
        for (i, item) in items.iter().enumerate() {
            // SAFETY: every item was written above
            assert_eq!(unsafe { *item.assume_init_ref() }, i as u64);
        }
        assert_eq!(pool.allocated(), 200);
        for item in items {
            pool.destroy(item);
        }
        assert_eq!(pool.free.iter_quiescent(&pool.slots).count(), 200);
    }

    #[test]
    fn partial_preheat_is_released() {
        let store = CountingStore::new(FailingStore::new(3));
        let res: Result<Pool<u8, _>, _> =
            ObjectPool::with_config(&store, PoolConfig::new().with_capacity(5));
        assert!(matches!(res, Err(Error::AllocationFailure { .. })));
        assert_eq!(store.live(), 0);
        assert_eq!(store.total(), 3);
    }

    #[test]
    #[should_panic(expected = "different pool")]
    fn foreign_destroy_panics() {
        let a: Pool<u32> = ObjectPool::with_capacity(1).unwrap();
        let b: Pool<u32> = ObjectPool::with_capacity(1).unwrap();
        let item = a.create().unwrap();
        b.destroy(item);
    }
}
