//! Memory management
//!
//! Nest uses a hybrid scheme. Every object is reference counted and is
//! released as soon as its count drops to zero. Instances of container
//! types can form reference cycles, so they are additionally tracked by a
//! generational collector that finds unreachable cycles with trial deletion.
//!
//! - [`Heap`] is the object arena: slots, headers, per-type free-lists.
//! - The collector lives in `collector` as more `impl Heap` methods.

mod allocator;
mod collector;

pub use allocator::{Heap, HeapStats};
pub use collector::{GcStats, Generation, GEN1_MAX, GEN2_MAX, GEN3_MAX, OLD_GEN_MIN};
pub(crate) use collector::Collector;
