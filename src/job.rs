//! Jobs: the unit of work applications hand to the dispatcher.

use std::cell::Cell;
use std::fmt;
use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::sync::SpinLock;

/// The signature of a job entry point: a plain function taking the opaque
/// user-data pointer that was passed to [`Dispatcher::submit`].
///
/// [`Dispatcher::submit`]: crate::dispatcher::Dispatcher::submit
pub type JobEntry = fn(*mut c_void);

////////////////////////////////////////////////////////////////////////////////
// Job
////////////////////////////////////////////////////////////////////////////////

/// One unit of application work: an entry point, its opaque argument and a
/// completion lock.
///
/// Jobs live in the dispatcher's job pool and are reused indefinitely. The
/// completion lock is the only synchronization between the submitter, the
/// worker that runs the job and anybody waiting on it: `submit` acquires it
/// before the job is queued, and the scheduler releases it exactly once
/// after the entry point has returned. A held completion lock therefore
/// means "queued or currently bound to a fiber".
pub struct Job {
    completion: SpinLock,
    entry: Cell<Option<JobEntry>>,
    user_data: Cell<*mut c_void>,
}

// `entry` and `user_data` are written by the submitter before the job is
// pushed onto the global queue and read by the single worker that popped it;
// the queue's internal lock orders the two. The completion lock is atomic.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Default for Job {
    fn default() -> Self {
        Self {
            completion: SpinLock::new(),
            entry: Cell::new(None),
            user_data: Cell::new(std::ptr::null_mut()),
        }
    }
}

impl Job {
    /// The job's completion lock.
    #[inline]
    pub fn completion(&self) -> &SpinLock {
        &self.completion
    }

    /// Installs the entry point and user data for the next run.
    pub(crate) fn prepare(&self, entry: JobEntry, user_data: *mut c_void) {
        self.entry.set(Some(entry));
        self.user_data.set(user_data);
    }

    /// Runs the entry point with the stored user data.
    pub(crate) fn invoke(&self) {
        let entry = self
            .entry
            .get()
            .expect("job invoked without an entry point");
        entry(self.user_data.get());
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("completed", &!self.completion.is_locked())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// JobHandle
////////////////////////////////////////////////////////////////////////////////

/// An opaque, non-owning reference to a submitted [`Job`].
///
/// A handle is valid from [`Dispatcher::submit`] until one successful
/// [`Dispatcher::wait_for`] call has observed the job complete. After that
/// the underlying job may be reused for an unrelated submission, so waiting
/// on the same handle twice is a programmer error.
///
/// [`Dispatcher::submit`]: crate::dispatcher::Dispatcher::submit
/// [`Dispatcher::wait_for`]: crate::dispatcher::Dispatcher::wait_for
#[derive(Debug, Clone, Copy)]
pub struct JobHandle(pub(crate) NonNull<Job>);

// A handle is just a stable address into the job pool; the job itself is
// `Sync` and the pool outlives every worker.
unsafe impl Send for JobHandle {}
unsafe impl Sync for JobHandle {}
