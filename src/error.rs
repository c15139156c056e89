//! Error handling utils.
//!
//! All fallible setup paths of the crate (worker spawning, core affinity,
//! execution context creation) report through the crate-wide [`Error`] enum.
//! The dispatcher additionally retains the text of the most recent failure,
//! readable via [`Dispatcher::last_error`], so that callers which only care
//! about a boolean outcome still have somewhere to look.
//!
//! Steady-state operations (`submit`, `wait_for`, `yield_now`) do not fail:
//! misuse such as submitting before init or exhausting a non-growing pool is
//! a programmer error and is asserted, not reported.
//!
//! [`Dispatcher::last_error`]: crate::dispatcher::Dispatcher::last_error

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An OS thread for a worker could not be spawned.
    #[error("failed to spawn worker thread {worker}: {source}")]
    WorkerStart { worker: usize, source: io::Error },

    /// A worker thread was spawned but could not be pinned to the
    /// requested logical core.
    #[error("failed to pin worker thread {worker} to core {core}: {source}")]
    WorkerAffinity {
        worker: usize,
        core: usize,
        source: io::Error,
    },

    /// The platform refused to prepare an execution context.
    #[error("failed to create execution context: {0}")]
    ContextCreate(#[source] io::Error),

    /// A resource pool with growth disabled ran out of objects.
    #[error("resource pool exhausted and growth is disabled")]
    PoolExhausted,
}
