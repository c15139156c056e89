//! Fiber-based cooperative job dispatcher for CPU-parallel workloads.
//!
//! Applications submit short units of work (jobs); the dispatcher runs them
//! concurrently across a pool of worker threads, each of which multiplexes
//! many user-space execution contexts ([fibers](fiber)). A job may submit
//! sub-jobs and wait on their completion without ever blocking its worker
//! thread: the wait suspends the calling fiber, the worker picks up other
//! work, and the suspended fiber resumes once the awaited job is done.
//!
//! The crate is built around:
//!
//! - the [`Dispatcher`](dispatcher) singleton: submit/wait/yield API, the
//!   global job queue and the per-worker scheduler loop,
//! - [fibers](fiber) and the [context-switch primitive](context) they run on,
//! - [worker threads](worker) with optional core pinning,
//! - [resource pools](pool) and the [spinlock/queue primitives](sync)
//!   backing all of the above.
//!
//! There is no preemption: a job runs until it returns, waits or yields.
//! Jobs must not panic; a panic is trapped at the fiber boundary and aborts
//! the process.
//!
//! ### Example
//!
//! ```no_run
//! use std::os::raw::c_void;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use weft::Dispatcher;
//!
//! fn entry(arg: *mut c_void) {
//!     let counter = unsafe { &*(arg as *const AtomicUsize) };
//!     counter.fetch_add(1, Ordering::Relaxed);
//! }
//!
//! let counter = AtomicUsize::new(0);
//!
//! let dispatcher = Dispatcher::instance();
//! dispatcher.init(100, 10_000, -1).unwrap();
//!
//! let job = dispatcher.submit(entry, &counter as *const _ as *mut c_void);
//! dispatcher.wait_for(job);
//! assert_eq!(counter.load(Ordering::Relaxed), 1);
//!
//! dispatcher.shutdown();
//! ```

#[cfg(not(unix))]
compile_error!("weft requires a unix target for its context-switch primitive");

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod fiber;
pub mod job;
pub mod pool;
pub mod sync;
pub mod worker;

pub use dispatcher::{Config, Dispatcher};
pub use error::{Error, Result};
pub use job::{JobEntry, JobHandle};
