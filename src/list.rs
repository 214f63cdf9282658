//! # Non-blocking intrusive LIFO list
//!
//! [`NonBlockingList`] is a CAS-based stack of slot indices. The "next" links
//! live in a [`LinkTable`] owned by whoever owns the slots, e.g. the
//! [`ObjectPool`](crate::pool::ObjectPool)'s slot directory, which makes the
//! list intrusive without overlaying links onto item memory.
//!
//! Removal is split into two CAS steps so that nothing is ever linked in front
//! of a half-removed head:
//!
//! 1. **Reserve**: CAS the head from `H` to `H` with the in-transition bit set.
//!    The set of reachable slots does not change.
//! 2. **Unlink**: CAS the head from the reserved `H` to `H.next`.
//!
//! Any thread that observes a reserved head, popper or prepender, performs
//! step 2 on behalf of the reserver before retrying its own operation. The
//! reserved slot belongs to the thread whose reservation CAS succeeded, no
//! matter who unlinked it.
//!
//! The head word also carries a version that is bumped by every successful
//! CAS, so a slot that is popped and prepended again between our read and our
//! CAS can never make a stale CAS succeed.

use crate::{
    handle::{SlotIndex, TaggedHandle},
    logging::trace,
    sync::{
        Backoff,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};
use core::fmt::Debug;

/// Storage for the "next" link of each slot.
///
/// Slots handed to a [`NonBlockingList`] are exclusively owned by that list
/// until they are popped again; the list is the only writer of their links
/// in the meantime.
pub trait LinkTable {
    /// Returns the link word of `slot`.
    ///
    /// Implementations may panic if `slot` is not part of the table.
    fn link(&self, slot: SlotIndex) -> &AtomicU32;
}

impl LinkTable for [AtomicU32] {
    fn link(&self, slot: SlotIndex) -> &AtomicU32 {
        &self[slot.as_usize()]
    }
}

impl<const N: usize> LinkTable for [AtomicU32; N] {
    fn link(&self, slot: SlotIndex) -> &AtomicU32 {
        &self[slot.as_usize()]
    }
}

impl<L: LinkTable + ?Sized> LinkTable for &L {
    fn link(&self, slot: SlotIndex) -> &AtomicU32 {
        L::link(self, slot)
    }
}

/// A lock-free LIFO list of slots.
///
/// Both [`prepend`](Self::prepend) and [`pop_first`](Self::pop_first) are
/// non-blocking but not wait-free: under contention a thread retries (with
/// [`Backoff`]) until its CAS lands.
///
/// The list never touches slot memory other than the links in the
/// [`LinkTable`], and never frees anything.
pub struct NonBlockingList {
    /// Packed [`Head`]
    head: AtomicU64,
}

/// The decoded head word.
///
/// Low 32 bits: [`TaggedHandle`]. High 32 bits: modification version.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Head {
    handle: TaggedHandle,
    version: u32,
}

impl Head {
    const fn unpack(word: u64) -> Self {
        Self {
            handle: TaggedHandle::from_raw(word as u32),
            version: (word >> 32) as u32,
        }
    }

    const fn pack(self) -> u64 {
        ((self.version as u64) << 32) | self.handle.into_raw() as u64
    }

    /// The head value that replaces `self` when `handle` is installed
    const fn advance(self, handle: TaggedHandle) -> Self {
        Self {
            handle,
            version: self.version.wrapping_add(1),
        }
    }
}

impl NonBlockingList {
    /// Create a new, empty list
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Create a new, empty list
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Insert `slot` as the new head of the list.
    ///
    /// `slot` must not currently be on this (or any other) list sharing
    /// `table`. If the current head is being removed, this thread first
    /// finishes that removal so that `slot` is never linked in front of it.
    pub fn prepend<L: LinkTable + ?Sized>(&self, table: &L, slot: SlotIndex) {
        let mut backoff = Backoff::new();
        let mut head = self.load_head();

        loop {
            if head.handle.in_transition() {
                trace!("prepend({:?}) helps unlink {:?}", slot, head.handle);
                head = match self.unlink(table, head) {
                    Ok(new) => new,
                    Err(actual) => {
                        backoff.spin();
                        actual
                    }
                };
                continue;
            }

            table
                .link(slot)
                .store(head.handle.into_raw(), Ordering::Relaxed);
            let new = head.advance(TaggedHandle::to(slot));

            // Release: publishes the link written above (and the caller's writes
            // to the slot's payload) to whoever pops `slot`.
            match self.head.compare_exchange(
                head.pack(),
                new.pack(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    head = Head::unpack(actual);
                    backoff.spin();
                }
            }
        }
    }

    /// Remove and return the head of the list, or `None` if the list is empty.
    pub fn pop_first<L: LinkTable + ?Sized>(&self, table: &L) -> Option<SlotIndex> {
        let mut backoff = Backoff::new();
        let mut head = self.load_head();

        loop {
            let slot = head.handle.target()?;

            if head.handle.in_transition() {
                // Someone else reserved this slot: finish their removal and look
                // at whatever becomes the new head.
                head = match self.unlink(table, head) {
                    Ok(new) => new,
                    Err(actual) => {
                        backoff.spin();
                        actual
                    }
                };
                continue;
            }

            let reserved = head.advance(head.handle.marked());
            match self.head.compare_exchange(
                head.pack(),
                reserved.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The only transition out of `reserved` is its unlink, so if
                    // this fails somebody already did it for us.
                    if self.unlink(table, reserved).is_err() {
                        trace!("pop_first: {:?} was unlinked by a helper", slot);
                    }
                    return Some(slot);
                }
                Err(actual) => {
                    head = Head::unpack(actual);
                    backoff.spin();
                }
            }
        }
    }

    /// Returns the current head slot, if any.
    ///
    /// Diagnostic only: by the time the caller looks at the result, the slot
    /// may already have been popped.
    pub fn peek_head(&self) -> Option<SlotIndex> {
        self.load_head().handle.target()
    }

    /// Returns `true` if the list was empty at the time of the call
    pub fn is_empty(&self) -> bool {
        self.load_head().handle.is_null()
    }

    /// Prepend every slot in `slots`, in order. The last slot ends up as the head.
    pub fn extend<L, I>(&self, table: &L, slots: I)
    where
        L: LinkTable + ?Sized,
        I: IntoIterator<Item = SlotIndex>,
    {
        for slot in slots {
            self.prepend(table, slot);
        }
    }

    /// Walk the list from head to tail.
    ///
    /// Only meaningful while no other thread is modifying the list; a
    /// concurrent pop or prepend may make the walk skip or repeat slots.
    pub fn iter_quiescent<'a, L: LinkTable + ?Sized>(&self, table: &'a L) -> QuiescentIter<'a, L> {
        QuiescentIter {
            table,
            next: self.load_head().handle,
        }
    }

    fn load_head(&self) -> Head {
        Head::unpack(self.head.load(Ordering::Acquire))
    }

    /// Unlink the reserved head `head`, replacing it with its successor.
    ///
    /// Returns the new head on success, or the head actually observed on
    /// failure.
    fn unlink<L: LinkTable + ?Sized>(&self, table: &L, head: Head) -> Result<Head, Head> {
        debug_assert!(head.handle.in_transition());
        let Some(slot) = head.handle.target() else {
            return Ok(head);
        };

        // The link was published by the Release CAS that made `slot` the head;
        // every later head CAS is a read-modify-write, so our Acquire load of
        // `head` already synchronizes with it.
        let next = TaggedHandle::from_raw(table.link(slot).load(Ordering::Relaxed));
        let new = head.advance(next.unmarked());

        self.head
            .compare_exchange(head.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| new)
            .map_err(Head::unpack)
    }
}

impl Default for NonBlockingList {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for NonBlockingList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let head = self.load_head();
        f.debug_struct("NonBlockingList")
            .field("head", &head.handle)
            .field("version", &head.version)
            .finish()
    }
}

/// Iterator returned by [`NonBlockingList::iter_quiescent`]
pub struct QuiescentIter<'a, L: LinkTable + ?Sized> {
    table: &'a L,
    next: TaggedHandle,
}

impl<L: LinkTable + ?Sized> Iterator for QuiescentIter<'_, L> {
    type Item = SlotIndex;

    fn next(&mut self) -> Option<SlotIndex> {
        let slot = self.next.target()?;
        self.next = TaggedHandle::from_raw(self.table.link(slot).load(Ordering::Acquire));
        Some(slot)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::test_utils::{link_table, slot};
    use test_log::test;

    #[test]
    fn lifo_order() {
        let table = link_table(8);
        let list = NonBlockingList::new();
        assert!(list.is_empty());
        assert_eq!(list.pop_first(&table[..]), None);

        list.extend(&table[..], (0..4).map(slot));
        assert_eq!(list.peek_head(), Some(slot(3)));

        let walked: Vec<_> = list.iter_quiescent(&table[..]).collect();
        assert_eq!(walked, vec![slot(3), slot(2), slot(1), slot(0)]);

        assert_eq!(list.pop_first(&table[..]), Some(slot(3)));
        assert_eq!(list.pop_first(&table[..]), Some(slot(2)));
        list.prepend(&table[..], slot(7));
        assert_eq!(list.pop_first(&table[..]), Some(slot(7)));
        assert_eq!(list.pop_first(&table[..]), Some(slot(1)));
        assert_eq!(list.pop_first(&table[..]), Some(slot(0)));
        assert_eq!(list.pop_first(&table[..]), None);
        assert!(list.is_empty());
    }

    #[test]
    fn every_cas_bumps_the_version() {
        let table = link_table(2);
        let list = NonBlockingList::new();
        list.prepend(&table[..], slot(0));
        let before = list.load_head();
        assert_eq!(before.version, 1);

        // reserve + unlink
        assert_eq!(list.pop_first(&table[..]), Some(slot(0)));
        let after = list.load_head();
        assert!(after.handle.is_null());
        assert_eq!(after.version, 3);
    }

    /// A head left reserved by a (stalled) popper is unlinked by the next
    /// prepend, which then inserts in front of the successor.
    #[test]
    fn prepend_helps_a_pending_pop() {
        let table = link_table(4);
        let list = NonBlockingList::new();
        list.extend(&table[..], [slot(0), slot(1)]);

        // Simulate a popper that reserved slot 1 and then got descheduled
        let head = list.load_head();
        let reserved = head.advance(head.handle.marked());
        list.head.store(reserved.pack(), Ordering::Release);
        assert_eq!(list.peek_head(), Some(slot(1)));

        list.prepend(&table[..], slot(2));

        let walked: Vec<_> = list.iter_quiescent(&table[..]).collect();
        assert_eq!(walked, vec![slot(2), slot(0)]);
        assert!(!list.load_head().handle.in_transition());
    }

    /// A popper that finds someone else's reservation finishes it, and does
    /// not return the reserved slot as its own.
    #[test]
    fn pop_helps_and_takes_the_next_slot() {
        let table = link_table(4);
        let list = NonBlockingList::new();
        list.extend(&table[..], [slot(0), slot(1), slot(2)]);

        let head = list.load_head();
        let reserved = head.advance(head.handle.marked());
        list.head.store(reserved.pack(), Ordering::Release);

        assert_eq!(list.pop_first(&table[..]), Some(slot(1)));
        assert_eq!(list.pop_first(&table[..]), Some(slot(0)));
        assert_eq!(list.pop_first(&table[..]), None);
    }

    #[test]
    fn head_packing() {
        let head = Head {
            handle: TaggedHandle::to(slot(41)).marked(),
            version: u32::MAX,
        };
        assert!(Head::unpack(head.pack()) == head);

        let next = head.advance(TaggedHandle::NULL);
        assert_eq!(next.version, 0);
        assert!(next.handle.is_null());
    }
}
