//! # Slot indices and tagged handles
//!
//! Every structure in this crate refers to its nodes by [`SlotIndex`] into a
//! slot table instead of by pointer. A [`TaggedHandle`] packs an optional slot
//! and the "in-transition" bit into a single `u32`, so one atomic word can carry
//! both the identity of a node and the fact that its removal is in progress.
//!
//! ```text
//!  31                                     1   0
//! ┌───────────────────────────────────────┬───┐
//! │          slot index + 1 (0 = null)    │ T │
//! └───────────────────────────────────────┴───┘
//! ```

use core::fmt::Debug;

/// Index of a slot in a [`LinkTable`](crate::list::LinkTable).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// The largest index that still fits into a [`TaggedHandle`]
    pub const MAX: u32 = (1 << 31) - 2;

    /// Create a new slot index.
    ///
    /// Returns `None` if `index` is larger than [`Self::MAX`].
    pub const fn new(index: u32) -> Option<Self> {
        if index <= Self::MAX {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Obtain the raw index
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Obtain the raw index as a `usize`, e.g. to index a slice
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Debug for SlotIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A possibly-null reference to a slot plus one "in-transition" bit.
///
/// The null handle never carries the in-transition bit: [`Self::marked`] on
/// null returns null, and [`Self::from_raw`] normalizes a marked null.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaggedHandle(u32);

impl TaggedHandle {
    const TRANSITION_BIT: u32 = 0b1;

    /// The handle that refers to nothing
    pub const NULL: Self = Self(0);

    /// A handle to `slot`, with the in-transition bit clear
    pub const fn to(slot: SlotIndex) -> Self {
        Self((slot.0 + 1) << 1)
    }

    /// Rebuild a handle from [`Self::into_raw`]
    pub const fn from_raw(raw: u32) -> Self {
        if raw >> 1 == 0 {
            Self::NULL
        } else {
            Self(raw)
        }
    }

    /// The packed representation
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    /// The slot this handle refers to, if any
    pub const fn target(self) -> Option<SlotIndex> {
        match self.0 >> 1 {
            0 => None,
            n => Some(SlotIndex(n - 1)),
        }
    }

    /// Is this the null handle?
    pub const fn is_null(self) -> bool {
        self.0 >> 1 == 0
    }

    /// Is the referenced slot currently being removed?
    pub const fn in_transition(self) -> bool {
        self.0 & Self::TRANSITION_BIT != 0
    }

    /// The same handle with the in-transition bit set.
    pub const fn marked(self) -> Self {
        if self.is_null() {
            Self::NULL
        } else {
            Self(self.0 | Self::TRANSITION_BIT)
        }
    }

    /// The same handle with the in-transition bit cleared
    pub const fn unmarked(self) -> Self {
        Self(self.0 & !Self::TRANSITION_BIT)
    }
}

impl Debug for TaggedHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.target() {
            None => f.write_str("TaggedHandle(null)"),
            Some(slot) if self.in_transition() => write!(f, "TaggedHandle({:?}, in transition)", slot),
            Some(slot) => write!(f, "TaggedHandle({:?})", slot),
        }
    }
}
