//! The dispatcher: the process-wide scheduler singleton.
//!
//! The dispatcher owns the fiber pool, the job pool, the global job queue
//! and the worker set. Applications [`submit`] jobs, [`wait_for`] their
//! completion and may cooperatively [`yield_now`] from inside a running
//! job; each worker thread runs the [scheduler loop](self) that multiplexes
//! job fibers over its own stack.
//!
//! A job may submit further jobs and wait on them without ever blocking its
//! worker: the wait suspends the calling fiber back to the worker's
//! scheduler fiber, which keeps admitting and resuming other work on the
//! same thread, the nested job included.
//!
//! [`submit`]: Dispatcher::submit
//! [`wait_for`]: Dispatcher::wait_for
//! [`yield_now`]: Dispatcher::yield_now

use std::io;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::fiber::{self, Fiber, FiberState};
use crate::job::{Job, JobEntry, JobHandle};
use crate::pool::ResourcePool;
use crate::sync::LockedQueue;
use crate::worker::{WorkerShared, WorkerState, WorkerThread};
use crate::Result;

/// Default number of pooled fibers.
pub const DEFAULT_FIBER_POOL_SIZE: usize = 100;
/// Default number of pooled jobs.
pub const DEFAULT_JOB_POOL_SIZE: usize = 10_000;
/// Default growth factor applied to both pools.
pub const DEFAULT_GROWTH_FACTOR: f32 = 1.0;
/// Default stack size for job fibers.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

static INSTANCE: Lazy<Dispatcher> = Lazy::new(Dispatcher::new);

////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////

/// Dispatcher configuration for [`Dispatcher::init_with`].
///
/// Methods can be chained to adjust the defaults:
///
/// ```no_run
/// use weft::{Config, Dispatcher};
///
/// Dispatcher::instance()
///     .init_with(
///         Config::new()
///             .fiber_pool_size(200)
///             .job_pool_size(50_000)
///             .worker_count(4)
///             .pin_workers(false),
///     )
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    fiber_pool_size: usize,
    job_pool_size: usize,
    worker_count: Option<usize>,
    growth_factor: f32,
    stack_size: usize,
    pin_workers: bool,
}

impl Config {
    /// Generates the default configuration: pools of
    /// [`DEFAULT_FIBER_POOL_SIZE`]/[`DEFAULT_JOB_POOL_SIZE`] with growth
    /// factor [`DEFAULT_GROWTH_FACTOR`], one worker per logical core except
    /// core 0, workers pinned starting at core 1.
    pub fn new() -> Self {
        Self {
            fiber_pool_size: DEFAULT_FIBER_POOL_SIZE,
            job_pool_size: DEFAULT_JOB_POOL_SIZE,
            worker_count: None,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            stack_size: DEFAULT_STACK_SIZE,
            pin_workers: true,
        }
    }

    /// Number of fibers to pre-allocate.
    pub fn fiber_pool_size(mut self, count: usize) -> Self {
        self.fiber_pool_size = count;
        self
    }

    /// Number of jobs to pre-allocate.
    pub fn job_pool_size(mut self, count: usize) -> Self {
        self.job_pool_size = count;
        self
    }

    /// Number of worker threads. The default is the logical core count
    /// minus one, leaving core 0 to the host application.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Proportional growth factor for both pools; `0.0` disables growth
    /// (not recommended in production, exhaustion then asserts in
    /// [`Dispatcher::submit`]).
    pub fn growth_factor(mut self, factor: f32) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Stack size for job fibers, in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Whether workers are pinned to logical cores (starting at core 1).
    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Dispatcher
////////////////////////////////////////////////////////////////////////////////

/// The process-wide job dispatcher.
///
/// There is exactly one instance per process, reachable through
/// [`instance`]; its lifecycle is explicit via [`init`]/[`init_with`] and
/// [`shutdown`].
///
/// [`instance`]: Self::instance
/// [`init`]: Self::init
/// [`init_with`]: Self::init_with
/// [`shutdown`]: Self::shutdown
#[derive(Debug)]
pub struct Dispatcher {
    fiber_pool: ResourcePool<Fiber>,
    job_pool: ResourcePool<Job>,
    /// The global MPMC job queue; workers pop, submitters push.
    queue: LockedQueue<JobHandle>,
    workers: Mutex<Vec<WorkerThread>>,
    stack_size: AtomicUsize,
    initialized: AtomicBool,
    last_error: Mutex<String>,
}

impl Dispatcher {
    fn new() -> Self {
        Self {
            fiber_pool: ResourcePool::new(),
            job_pool: ResourcePool::new(),
            queue: LockedQueue::new(),
            workers: Mutex::new(Vec::new()),
            stack_size: AtomicUsize::new(DEFAULT_STACK_SIZE),
            initialized: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
        }
    }

    /// The process-wide dispatcher instance.
    pub fn instance() -> &'static Dispatcher {
        &INSTANCE
    }

    /// Initializes pools and spawns `worker_count` workers
    /// (`-1` = logical cores − 1). Blocks until every worker's scheduler
    /// loop is running, or until any worker reports a startup failure.
    ///
    /// Convenience over [`init_with`](Self::init_with).
    pub fn init(
        &self,
        fiber_pool_size: usize,
        job_pool_size: usize,
        worker_count: i32,
    ) -> Result<()> {
        let mut config = Config::new()
            .fiber_pool_size(fiber_pool_size)
            .job_pool_size(job_pool_size);
        if worker_count >= 0 {
            config = config.worker_count(worker_count as usize);
        }
        self.init_with(config)
    }

    /// Initializes the dispatcher from `config`. See [`init`](Self::init).
    pub fn init_with(&self, config: Config) -> Result<()> {
        let mut workers = self.workers.lock().expect("worker set mutex poisoned");
        assert!(workers.is_empty(), "dispatcher is already initialized");

        self.fiber_pool.set_growth_factor(config.growth_factor);
        self.job_pool.set_growth_factor(config.growth_factor);
        // Top the pools up to the requested capacity. A re-init after
        // shutdown keeps whatever the previous cycle allocated.
        let fibers = self.fiber_pool.total_count();
        if config.fiber_pool_size > fibers {
            self.fiber_pool.grow(config.fiber_pool_size - fibers);
        }
        let jobs = self.job_pool.total_count();
        if config.job_pool_size > jobs {
            self.job_pool.grow(config.job_pool_size - jobs);
        }
        self.stack_size.store(config.stack_size, Ordering::Relaxed);

        let worker_count = config.worker_count.unwrap_or_else(default_worker_count);
        assert!(worker_count >= 1, "dispatcher needs at least one worker");
        log::debug!(
            "initializing dispatcher: {} fibers, {} jobs, {} workers",
            self.fiber_pool.total_count(),
            self.job_pool.total_count(),
            worker_count,
        );

        for index in 0..worker_count {
            let mut worker = WorkerThread::new(index);
            // Core 0 is reserved for the host application.
            let core = if config.pin_workers { Some(index + 1) } else { None };
            if let Err(err) = worker.start(core) {
                self.set_last_error(err.to_string());
                for started in workers.iter_mut() {
                    started.stop();
                }
                workers.clear();
                return Err(err);
            }
            workers.push(worker);
        }

        // Every worker must observe Running before init returns. A worker
        // that went straight to Done bailed out during startup.
        loop {
            let mut failed = None;
            let mut all_running = true;
            for worker in workers.iter() {
                match worker.state() {
                    WorkerState::Running => {}
                    WorkerState::Done => {
                        failed = Some(worker.index());
                        break;
                    }
                    _ => all_running = false,
                }
            }
            if let Some(index) = failed {
                let message = self.last_error();
                for started in workers.iter_mut() {
                    started.stop();
                }
                workers.clear();
                return Err(Error::WorkerStart {
                    worker: index,
                    source: io::Error::new(io::ErrorKind::Other, message),
                });
            }
            if all_running {
                break;
            }
            thread::yield_now();
        }

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops the dispatcher.
    ///
    /// Outstanding work is drained first: shutdown waits for the global
    /// queue to empty and for every job to return to its pool, then stops
    /// each worker in order, waiting for its thread to exit. A job that
    /// never completes makes this wait forever; quiesce your own work
    /// before shutting down.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().expect("worker set mutex poisoned");
        if workers.is_empty() {
            return;
        }

        while self.queue.len() > 0 || self.job_pool.free_count() < self.job_pool.total_count() {
            thread::yield_now();
        }

        for worker in workers.iter_mut() {
            worker.stop();
        }
        workers.clear();
        self.initialized.store(false, Ordering::Release);
        log::debug!("dispatcher shut down");
    }

    /// Submits a job for execution and returns its handle.
    ///
    /// The job's completion lock is held from this point until the entry
    /// point has returned on some worker, which is what makes
    /// [`wait_for`](Self::wait_for) block for exactly that long.
    ///
    /// The entry point runs on a worker fiber. It may call `submit`,
    /// `wait_for` and `yield_now` freely; it must not panic.
    pub fn submit(&self, entry: JobEntry, user_data: *mut c_void) -> JobHandle {
        assert!(
            self.initialized.load(Ordering::Acquire),
            "dispatcher is not initialized"
        );

        let job_ptr = self.job_pool.get().expect("job pool exhausted");
        let job = unsafe { job_ptr.as_ref() };

        job.completion().lock();
        job.prepare(entry, user_data);

        let handle = JobHandle(job_ptr);
        self.queue.push(handle);
        handle
    }

    /// Blocks until the job behind `handle` has completed.
    ///
    /// Inside a fiber, "blocks" means the fiber suspends back to its
    /// worker's scheduler, which keeps running other jobs on the same
    /// thread; outside the fiber system the OS thread yields between polls.
    ///
    /// A handle may be waited on successfully once. After that the job is
    /// recycled and the handle must not be used again.
    pub fn wait_for(&self, handle: JobHandle) {
        let job = unsafe { handle.0.as_ref() };
        while !job.completion().try_lock() {
            suspend_current(true);
        }
        // Drop the lock right away: the wait only observes completion, it
        // does not take ownership of the job.
        job.completion().unlock();
    }

    /// Cooperatively gives up the rest of this job's time slice.
    ///
    /// Inside a fiber this switches to the worker's scheduler fiber, which
    /// will resume the caller on a later iteration; outside the fiber
    /// system it yields the OS thread.
    pub fn yield_now(&self) {
        suspend_current(false);
    }

    /// Number of workers currently owned by the dispatcher.
    pub fn worker_thread_count(&self) -> usize {
        self.workers.lock().expect("worker set mutex poisoned").len()
    }

    /// Jobs sitting in the global queue, not yet bound to a fiber.
    pub fn job_queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Jobs currently available in the job pool.
    pub fn free_job_count(&self) -> usize {
        self.job_pool.free_count()
    }

    /// Total jobs allocated by the job pool.
    pub fn free_job_total(&self) -> usize {
        self.job_pool.total_count()
    }

    /// Fibers currently available in the fiber pool.
    pub fn fiber_pool_free(&self) -> usize {
        self.fiber_pool.free_count()
    }

    /// Total fibers allocated by the fiber pool.
    pub fn fiber_pool_total(&self) -> usize {
        self.fiber_pool.total_count()
    }

    /// Peak number of jobs in use at once. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn free_job_high_water_mark(&self) -> isize {
        self.job_pool.high_water_mark()
    }

    /// Peak number of fibers in use at once. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn free_fiber_high_water_mark(&self) -> isize {
        self.fiber_pool.high_water_mark()
    }

    /// Text of the most recent startup error.
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .expect("last error mutex poisoned")
            .clone()
    }

    pub(crate) fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock().expect("last error mutex poisoned") = message.into();
    }

    fn stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Relaxed)
    }
}

fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

/// Suspends the calling fiber back to its worker's scheduler fiber, or
/// yields the OS thread when there is no current fiber to suspend (the
/// caller is outside the fiber system, or is a scheduler fiber itself).
fn suspend_current(waiting: bool) {
    let current = fiber::current();
    let parent = current.and_then(|f| unsafe { f.as_ref() }.parent());
    match (current, parent) {
        (Some(fiber_ptr), Some(parent_ptr)) => {
            let fiber = unsafe { fiber_ptr.as_ref() };
            if waiting {
                fiber.set_state(FiberState::Waiting);
            }
            unsafe { parent_ptr.as_ref().switch_to() };
            if waiting {
                fiber.set_state(FiberState::Running);
            }
        }
        _ => thread::yield_now(),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler loop
////////////////////////////////////////////////////////////////////////////////

/// The scheduler loop each worker thread runs.
///
/// The thread's own stack becomes the worker's scheduler fiber: the parent
/// every activated job fiber suspends back to. The loop interleaves two
/// duties until the worker is told to stop: resume fibers that yielded
/// without finishing (the worker-local pending set, oldest first), and bind
/// new jobs from the global queue to fresh pool fibers.
pub(crate) fn scheduler(shared: Arc<WorkerShared>) {
    let dispatcher = Dispatcher::instance();

    let scheduler_fiber = match Fiber::adopt_current() {
        Ok(fiber) => fiber,
        Err(err) => {
            log::error!("worker failed to adopt its thread as a fiber: {}", err);
            dispatcher.set_last_error(err.to_string());
            shared.set_state(WorkerState::Done);
            return;
        }
    };
    fiber::set_current(&scheduler_fiber);
    let stack_size = dispatcher.stack_size();

    // Fibers that switched back without completing their job. Only this
    // thread touches it, no locking needed.
    let mut pending: Vec<NonNull<Fiber>> = Vec::new();

    if !shared.try_begin_running() {
        // A stop raced in before the loop ever started.
        shared.set_state(WorkerState::Done);
        return;
    }

    while shared.state() == WorkerState::Running {
        let mut did_work = false;

        // Give every pending fiber a chance to make progress.
        let mut i = 0;
        while i < pending.len() {
            did_work = true;
            let fiber_ptr = pending[i];
            let fiber = unsafe { fiber_ptr.as_ref() };

            unsafe { fiber.switch_to() };

            match fiber.state() {
                // Yielded again; try it on the next round.
                FiberState::Running | FiberState::Waiting => i += 1,
                FiberState::Idle => {
                    pending.remove(i);
                    finish_fiber(dispatcher, fiber_ptr);
                }
                FiberState::None => unreachable!("pending fiber was never activated"),
            }
        }

        // Admit one new job from the global queue.
        if let Some(handle) = dispatcher.queue.pop() {
            did_work = true;

            let fiber_ptr = loop {
                match dispatcher.fiber_pool.get() {
                    Some(ptr) => break ptr,
                    // Every fiber is checked out on some worker; one will
                    // come back once its job yields or finishes.
                    None => std::hint::spin_loop(),
                }
            };
            let fiber = unsafe { fiber_ptr.as_ref() };

            match unsafe { fiber.activate(handle.0, &scheduler_fiber, stack_size) } {
                Ok(()) => match fiber.state() {
                    FiberState::Running | FiberState::Waiting => pending.push(fiber_ptr),
                    FiberState::Idle => finish_fiber(dispatcher, fiber_ptr),
                    FiberState::None => unreachable!("activated fiber has no state"),
                },
                Err(err) => {
                    // The fiber could not be set up; put the job back for
                    // another attempt and surface the error.
                    log::error!("failed to activate a fiber: {}", err);
                    dispatcher.set_last_error(err.to_string());
                    fiber.recycle();
                    unsafe { dispatcher.fiber_pool.release(fiber_ptr) };
                    dispatcher.queue.push(handle);
                }
            }
        }

        if !did_work {
            std::hint::spin_loop();
        }
    }

    shared.set_state(WorkerState::Done);
}

/// Recycles a fiber whose job has completed: releases the completion lock
/// so waiters can proceed, then returns both objects to their pools.
fn finish_fiber(dispatcher: &Dispatcher, fiber_ptr: NonNull<Fiber>) {
    let fiber = unsafe { fiber_ptr.as_ref() };
    let job_ptr = fiber
        .take_job()
        .expect("idle fiber has no job to recycle");

    unsafe { job_ptr.as_ref() }.completion().unlock();

    fiber.recycle();
    unsafe {
        dispatcher.fiber_pool.release(fiber_ptr);
        dispatcher.job_pool.release(job_ptr);
    }
}
