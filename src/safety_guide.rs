//! # Implementor's safety guide
//!
//! This is only relevant if you are working on (or curious about) the internals of
//! `pool-noodle` - as a user, all safety invariants are maintained internally,
//! except for the ones spelled out on `PoolItem`'s unsafe methods.
//!
//! ## The Safety Rules
//!
//! ### Head word
//!
//! ```text
//!  63                 32 31                  1   0
//! ┌─────────────────────┬─────────────────────┬───┐
//! │       version       │   slot index + 1    │ T │
//! └─────────────────────┴─────────────────────┴───┘
//! ```
//!
//! ALL head changes are a single CAS on the whole word, and ALL of them bump the
//! version.
//!
//! ### `NonBlockingList` Rules
//!
//! 1. A slot is in at most one place at a time: on the list, or owned by exactly
//!    one caller. A caller MUST NOT prepend a slot it does not own.
//! 2. The link of a slot is ONLY written by `prepend`, while the slot is owned by
//!    the prepending thread (i.e. not reachable from the head).
//! 3. Nothing is EVER linked in front of a head with the `T` bit set:
//!     * `prepend` that observes `T` MUST unlink first, then retry.
//!     * `pop_first` that observes `T` MUST unlink first, then retry.
//! 4. The thread whose reservation CAS (`H` -> `H | T`) succeeded owns `H`. The
//!    unlink (`H | T` -> `H.next`) may be done by anyone, and does not transfer
//!    ownership.
//! 5. The list never frees a slot. Slot storage MUST outlive every list
//!    operation that may read its link, which for a pool means "until the pool
//!    is dropped".
//!
//! ### `ObjectPool` Rules
//!
//! 1. Directory segments are allocated ONLY while holding the growth mutex, and
//!    are published (Release) before any index pointing into them escapes.
//! 2. A slot's item pointer is written ONCE, holding the growth mutex, before the
//!    slot's index is returned from `grow`.
//! 3. Segments and item memory are released ONLY in `Drop`. `PoolItem` borrows the
//!    pool, so no item exists at that time.
//! 4. A `PoolItem` is the ONLY handle to its memory while it exists:
//!     * `destroy` consumes it, so double destroy does not compile.
//!     * `destroy` on the wrong pool panics, and the slot is NOT prepended.
//!
//! ### `AssetLifecycle` Transitions
//!
//! ```text
//! ┌──────────┐  (1)   ┌─────────┐  (2)   ┌──────────────┐  (4)  ┌───────────────┐
//! │ Unloaded │───────▶│ Loading │───────▶│ Unreferenced │◀─────▶│ Referenced(n) │
//! └──────────┘        └─────────┘        └──────────────┘  (5)  └───────────────┘
//!      ▲                   │(3)                 │(6)
//!      ├───────────────────┘                    ▼
//!      │               (7)               ┌───────────┐
//!      └─────────────────────────────────│ Unloading │
//!                                        └───────────┘
//! ```
//!
//! 1. Unloaded -> Loading
//!     * CAS in `load()`/`try_load()`, the winner runs the side effect
//! 2. Loading -> Unreferenced
//!     * plain store (Release), ONLY by the thread that won (1)
//! 3. Loading -> Unloaded
//!     * plain store, ONLY by the thread that won (1), when the side effect
//!       failed or unwound
//! 4. / 5. Unreferenced <-> Referenced(n), Referenced(n) <-> Referenced(n ± 1)
//!     * CAS in `add_reference()`/`remove_reference()`, never past `MAX_REF_COUNT`
//! 6. Unreferenced -> Unloading
//!     * CAS in `unload()`, the winner runs the side effect
//! 7. Unloading -> Unloaded (or back to Unreferenced if the side effect unwound)
//!     * plain store, ONLY by the thread that won (6)
//!
//! Loading and Unloading are "owned" states: while in them, only the owning thread
//! may write the state word. Everybody else either spins, or leaves without
//! touching the state.
