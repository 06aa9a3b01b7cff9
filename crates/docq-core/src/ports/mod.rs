//! Ports - abstractions over the outside world.
//!
//! The queue engine talks to its document store and to wall-clock time only
//! through these traits, so backends and clocks can be swapped in tests.

pub mod clock;
pub mod item_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::item_store::{
    IndexField, IndexSpec, ItemFilter, ItemPatch, ItemStore, LeaseState, LeaseUpdate,
};
