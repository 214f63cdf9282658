//! Lock-free resource lifecycle primitives
#![doc = include_str!("../README.md")]
#![cfg_attr(not(any(test, doctest, feature = "std")), no_std)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::undocumented_unsafe_blocks)]
#![allow(
    clippy::uninlined_format_args,
    reason = "Having inlined variables does not work with defmt"
)]

extern crate alloc;

pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod list;
pub mod pool;
pub mod safety_guide;
pub mod store;

// re-export some dependencies
pub use mutex;
pub use mutex_traits;

#[cfg(any(test, feature = "std"))]
#[doc(hidden)]
pub mod test_utils;

mod sync;

#[cfg(all(test, loom))]
mod loom;

#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use handle::{SlotIndex, TaggedHandle};
#[doc(inline)]
pub use lifecycle::{AssetLifecycle, AssetState, LoadOutcome, UnloadOutcome};
#[doc(inline)]
pub use list::{LinkTable, NonBlockingList};
#[doc(inline)]
pub use pool::{ObjectPool, PoolConfig, PoolItem};
#[doc(inline)]
pub use store::{BackingStore, GlobalStore};

#[allow(unused)]
pub(crate) mod logging {
    #[cfg(feature = "std")]
    pub use log::*;

    #[cfg(feature = "defmt")]
    pub use defmt::*;

    #[cfg(all(feature = "std", feature = "defmt"))]
    compile_error!("Cannot enable both 'std' and 'defmt' features simultaneously");

    /// No-op macros when no logging feature is enabled
    #[cfg(not(any(feature = "std", feature = "defmt")))]
    macro_rules! trace {
        ($s:literal $(, $x:expr)* $(,)?) => {
            {
            let _ = ($( & $x ),*);
            }
        };
    }

    #[cfg(not(any(feature = "std", feature = "defmt")))]
    macro_rules! debug {
        ($s:literal $(, $x:expr)* $(,)?) => {
            {
            let _ = ($( & $x ),*);
            }
        };
    }

    #[cfg(not(any(feature = "std", feature = "defmt")))]
    macro_rules! info {
        ($s:literal $(, $x:expr)* $(,)?) => {
            {
            let _ = ($( & $x ),*);
            }
        };
    }

    #[cfg(not(any(feature = "std", feature = "defmt")))]
    macro_rules! log_warn {
        ($s:literal $(, $x:expr)* $(,)?) => {
            {
            let _ = ($( & $x ),*);
            }
        };
    }

    #[cfg(not(any(feature = "std", feature = "defmt")))]
    macro_rules! error {
        ($s:literal $(, $x:expr)* $(,)?) => {{
            let _ = ($( & $x ),*);
        }
        };
    }

    #[cfg(not(any(feature = "std", feature = "defmt")))]
    pub(crate) use {debug, error, info, log_warn as warn, trace};
}
