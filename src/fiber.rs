//! Cooperative execution contexts.
//!
//! A [`Fiber`] is a reusable user-space stack that runs one [`Job`] per
//! activation. Pool fibers spend their life inside an infinite run loop:
//! execute the bound job, flip to [`Idle`], switch back to the parent
//! scheduler fiber, and park there until the next [`activate`] resumes the
//! loop for a fresh job.
//!
//! Each OS thread tracks which fiber is currently executing on it in a
//! thread-local cell, updated at every switch boundary. That cell is how
//! code deep inside a job recovers "my own fiber" to suspend itself, and
//! how [`Dispatcher::wait_for`] detects that it was called from outside the
//! fiber system and should fall back to an OS-level yield.
//!
//! [`Idle`]: FiberState::Idle
//! [`activate`]: Fiber::activate
//! [`Dispatcher::wait_for`]: crate::dispatcher::Dispatcher::wait_for

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::context::{Context, ContextEntry};
use crate::job::Job;
use crate::Result;

thread_local! {
    /// The fiber currently executing on this thread, updated by every
    /// [`Fiber::switch_to`]. `None` on threads that never entered the fiber
    /// system.
    static CURRENT: Cell<Option<NonNull<Fiber>>> = Cell::new(None);
}

/// Returns the fiber currently executing on this thread, if any.
pub(crate) fn current() -> Option<NonNull<Fiber>> {
    CURRENT.with(|cell| cell.get())
}

/// Marks `fiber` as the one executing on this thread. Called by a worker
/// when it adopts its own stack as the scheduler fiber.
pub(crate) fn set_current(fiber: &Fiber) {
    CURRENT.with(|cell| cell.set(Some(NonNull::from(fiber))));
}

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle states of a [`Fiber`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created but never activated.
    None = 0,
    /// Executing a job, or suspended mid-job after a cooperative yield.
    Running = 1,
    /// Finished its job; eligible to go back to the fiber pool.
    Idle = 2,
    /// Suspended inside a wait for another job. From the scheduler's point
    /// of view this is the same as [`Running`]: resume it and see.
    ///
    /// [`Running`]: Self::Running
    Waiting = 3,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Running,
            2 => Self::Idle,
            3 => Self::Waiting,
            _ => unreachable!("invalid fiber state {}", value),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A reusable cooperative execution context.
///
/// A fiber is either parked on the fiber pool's free list (state [`None`] or
/// [`Idle`], no parent, no job) or bound to exactly one job and tracked in
/// exactly one worker's pending set. Fibers never migrate mid-activation;
/// after an activation completes, the next one may happen on any worker.
///
/// The pool allocates fibers boxed, so a fiber's address is stable for the
/// dispatcher's whole lifetime; the run loop and the thread-local current
/// cell rely on that.
///
/// [`None`]: FiberState::None
/// [`Idle`]: FiberState::Idle
pub struct Fiber {
    state: AtomicU8,
    /// Created lazily on first activation, once the fiber sits at its final
    /// heap address.
    context: UnsafeCell<Option<Context>>,
    /// The scheduler fiber of the worker that activated us; switch target
    /// for yields and completion.
    parent: Cell<Option<NonNull<Fiber>>>,
    /// The job bound by the current activation.
    job: Cell<Option<NonNull<Job>>>,
}

// A fiber is handed between threads only through the fiber pool's free list
// or a worker's private pending set, and only one thread ever touches it at
// a time; the pool's internal lock orders the handoffs.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Default for Fiber {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(FiberState::None as u8),
            context: UnsafeCell::new(None),
            parent: Cell::new(None),
            job: Cell::new(None),
        }
    }
}

impl Fiber {
    /// Wraps the calling OS thread's own stack in a `Fiber`, making it a
    /// valid parent for activated job fibers.
    ///
    /// This is how each worker materializes its scheduler fiber. The
    /// returned fiber has no parent and no job; it is not a pool fiber and
    /// must never be activated.
    pub(crate) fn adopt_current() -> Result<Self> {
        Ok(Self {
            state: AtomicU8::new(FiberState::None as u8),
            context: UnsafeCell::new(Some(Context::adopt_current()?)),
            parent: Cell::new(None),
            job: Cell::new(None),
        })
    }

    /// Current lifecycle state. Advisory across threads.
    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// The scheduler fiber of the worker that activated this fiber, if it
    /// is currently activated.
    #[inline]
    pub(crate) fn parent(&self) -> Option<NonNull<Fiber>> {
        self.parent.get()
    }

    /// The job bound by the current activation, if any. Advisory.
    #[inline]
    pub fn current_job(&self) -> Option<NonNull<Job>> {
        self.job.get()
    }

    /// Unbinds and returns the current job.
    pub(crate) fn take_job(&self) -> Option<NonNull<Job>> {
        self.job.take()
    }

    /// Clears the activation bindings before the fiber goes back to the
    /// free list.
    pub(crate) fn recycle(&self) {
        self.job.set(None);
        self.parent.set(None);
    }

    /// Binds `job` to this fiber and transfers execution to it.
    ///
    /// Returns once the fiber switches back: either the job finished (state
    /// [`Idle`](FiberState::Idle)) or it cooperatively suspended (state
    /// [`Running`](FiberState::Running)/[`Waiting`](FiberState::Waiting)).
    ///
    /// # Safety
    ///
    /// Must be called from the fiber that is current on this thread (a
    /// worker's scheduler fiber). `self` must be a pool fiber in state
    /// `None` or `Idle`, at a stable heap address, and `job` must stay
    /// valid until the activation completes.
    pub(crate) unsafe fn activate(
        &self,
        job: NonNull<Job>,
        parent: &Fiber,
        stack_size: usize,
    ) -> Result<()> {
        debug_assert!(
            matches!(self.state(), FiberState::None | FiberState::Idle),
            "activating a fiber that is still in use"
        );
        self.ensure_context(stack_size)?;
        self.job.set(Some(job));
        self.parent.set(Some(NonNull::from(parent)));
        self.switch_to();
        Ok(())
    }

    /// Transfers execution to this fiber, parking the caller's state in the
    /// thread's current fiber. Returns when something switches back.
    ///
    /// # Safety
    ///
    /// The thread must have a current fiber (set by the worker at adoption
    /// time) and `self` must already have a context.
    pub(crate) unsafe fn switch_to(&self) {
        let from = current().expect("fiber switch on a thread outside the fiber system");
        CURRENT.with(|cell| cell.set(Some(NonNull::from(self))));

        let to_ctx = (*self.context.get())
            .as_ref()
            .expect("switch target has no context");
        let from_ctx = (*from.as_ref().context.get())
            .as_ref()
            .expect("current fiber has no context");
        to_ctx.switch_from(from_ctx);
    }

    /// Creates the execution context on first activation.
    ///
    /// Deferred to this point because the context captures `self`'s address,
    /// which is only final once the pool has boxed the fiber.
    unsafe fn ensure_context(&self, stack_size: usize) -> Result<()> {
        let slot = &mut *self.context.get();
        if slot.is_none() {
            let arg = self as *const Fiber as *mut c_void;
            *slot = Some(Context::new(stack_size, fiber_main as ContextEntry, arg)?);
        }
        Ok(())
    }

    /// The body of every pool fiber: run the bound job, go idle, give the
    /// worker its stack back, repeat on the next activation.
    fn run(&self) -> ! {
        loop {
            self.set_state(FiberState::Running);

            let job = self.job.get().expect("fiber activated without a job");
            let job = unsafe { job.as_ref() };

            // A panic must not unwind across the context switch boundary;
            // trap it here and honor the abort-on-job-failure policy.
            if panic::catch_unwind(AssertUnwindSafe(|| job.invoke())).is_err() {
                log::error!("job entry point panicked inside a fiber, aborting");
                process::abort();
            }

            // The entry point returned; let the scheduler release the
            // completion lock and recycle us.
            self.set_state(FiberState::Idle);
            let parent = self
                .parent
                .get()
                .expect("job fiber has no parent to return to");
            unsafe { parent.as_ref().switch_to() };
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state())
            .field("bound", &self.job.get().is_some())
            .finish_non_exhaustive()
    }
}

extern "C" fn fiber_main(arg: *mut c_void) -> ! {
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run()
}

#[cfg(test)]
mod tests {
    use super::{set_current, Fiber, FiberState};
    use crate::job::{Job, JobEntry};
    use std::os::raw::c_void;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_STACK: usize = 32 * 1024;

    fn count_up(arg: *mut c_void) {
        let counter = unsafe { &*(arg as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn runs_job_then_goes_idle_and_is_reusable() {
        let scheduler = Box::new(Fiber::adopt_current().unwrap());
        set_current(&scheduler);

        let hits = AtomicUsize::new(0);
        let job = Box::new(Job::default());
        job.prepare(count_up as JobEntry, &hits as *const _ as *mut c_void);

        let fiber = Box::new(Fiber::default());
        assert_eq!(fiber.state(), FiberState::None);

        unsafe {
            fiber
                .activate(NonNull::from(&*job), &scheduler, TEST_STACK)
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Idle);

        // A recycled fiber runs the next activation on the same stack.
        fiber.take_job();
        fiber.recycle();
        unsafe {
            fiber
                .activate(NonNull::from(&*job), &scheduler, TEST_STACK)
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Idle);
    }

    #[test]
    fn current_is_none_outside_the_fiber_system() {
        // This test runs on a plain libtest thread with no adoption.
        assert!(super::current().is_none());
    }
}
