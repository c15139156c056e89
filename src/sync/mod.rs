//! Low-level synchronization primitives shared by the scheduler internals.
//!
//! Everything in here is built for very short critical sections on the hot
//! dispatch path. For blocking of any meaningful duration use the fiber
//! layer instead: a fiber that needs to wait suspends itself back to its
//! scheduler, it does not spin.

pub mod queue;
pub mod spin;

pub use queue::LockedQueue;
pub use spin::SpinLock;
