//! End-to-end scenarios for the dispatcher: init/shutdown cycles, job
//! submission, nested waits and pool accounting.
//!
//! The dispatcher is a process-wide singleton, so every test serializes on
//! one mutex and leaves the dispatcher shut down behind itself.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use weft::{Config, Dispatcher};

static SERIAL: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn test_config() -> Config {
    // Core pinning is left off: the test machine's cpuset is not ours to
    // assume, and affinity is covered by its own error path anyway.
    Config::new()
        .fiber_pool_size(100)
        .job_pool_size(10_000)
        .worker_count(2)
        .pin_workers(false)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {}", what);
        std::thread::yield_now();
    }
}

fn count_up(arg: *mut c_void) {
    let counter = unsafe { &*(arg as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn init_and_shutdown() {
    let _guard = serialize();
    let dispatcher = Dispatcher::instance();

    dispatcher.init_with(test_config()).unwrap();
    assert_eq!(dispatcher.worker_thread_count(), 2);
    assert!(dispatcher.fiber_pool_total() >= 100);
    assert!(dispatcher.free_job_total() >= 10_000);

    dispatcher.shutdown();
    assert_eq!(dispatcher.worker_thread_count(), 0);

    // The dispatcher supports another full lifecycle after shutdown.
    dispatcher.init_with(test_config()).unwrap();
    assert_eq!(dispatcher.worker_thread_count(), 2);
    dispatcher.shutdown();
}

#[test]
fn single_job_runs_exactly_once() {
    let _guard = serialize();
    let dispatcher = Dispatcher::instance();
    dispatcher.init_with(test_config()).unwrap();

    let counter = AtomicUsize::new(0);
    let handle = dispatcher.submit(count_up, &counter as *const _ as *mut c_void);
    dispatcher.wait_for(handle);

    assert_eq!(counter.load(Ordering::SeqCst), 1);

    dispatcher.shutdown();
}

struct NestedState {
    parent_runs: AtomicUsize,
    child_runs: AtomicUsize,
}

fn nested_child(arg: *mut c_void) {
    let state = unsafe { &*(arg as *const NestedState) };
    state.child_runs.fetch_add(1, Ordering::SeqCst);
}

fn nested_parent(arg: *mut c_void) {
    let state = unsafe { &*(arg as *const NestedState) };
    let dispatcher = Dispatcher::instance();

    // Waiting on the child suspends this fiber; the worker keeps running
    // other work, including the child itself.
    let child = dispatcher.submit(nested_child, arg);
    dispatcher.wait_for(child);

    assert_eq!(state.child_runs.load(Ordering::SeqCst), 1);
    state.parent_runs.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn nested_submit_and_wait_inside_a_job() {
    let _guard = serialize();
    let dispatcher = Dispatcher::instance();
    dispatcher.init_with(test_config()).unwrap();

    let state = NestedState {
        parent_runs: AtomicUsize::new(0),
        child_runs: AtomicUsize::new(0),
    };
    let handle = dispatcher.submit(nested_parent, &state as *const _ as *mut c_void);
    dispatcher.wait_for(handle);

    assert_eq!(state.parent_runs.load(Ordering::SeqCst), 1);
    assert_eq!(state.child_runs.load(Ordering::SeqCst), 1);

    // Both the parent's and the child's job and fiber go back to the pools.
    wait_until("pools return to capacity", || {
        dispatcher.free_job_count() == dispatcher.free_job_total()
            && dispatcher.fiber_pool_free() == dispatcher.fiber_pool_total()
    });

    dispatcher.shutdown();
}

#[test]
fn nested_wait_does_not_deadlock_a_single_worker() {
    let _guard = serialize();
    let dispatcher = Dispatcher::instance();
    // One worker: the child can only ever run on the same thread that is
    // "blocked" in the parent's wait.
    dispatcher
        .init_with(test_config().worker_count(1))
        .unwrap();

    let state = NestedState {
        parent_runs: AtomicUsize::new(0),
        child_runs: AtomicUsize::new(0),
    };
    let handle = dispatcher.submit(nested_parent, &state as *const _ as *mut c_void);
    dispatcher.wait_for(handle);

    assert_eq!(state.parent_runs.load(Ordering::SeqCst), 1);
    assert_eq!(state.child_runs.load(Ordering::SeqCst), 1);

    dispatcher.shutdown();
}

#[test]
fn many_jobs_drain_and_pools_recover() {
    const JOBS: usize = 300;

    let _guard = serialize();
    let dispatcher = Dispatcher::instance();
    dispatcher.init_with(test_config()).unwrap();

    let counter = AtomicUsize::new(0);
    let handles: Vec<_> = (0..JOBS)
        .map(|_| dispatcher.submit(count_up, &counter as *const _ as *mut c_void))
        .collect();

    for handle in handles {
        dispatcher.wait_for(handle);
    }
    assert_eq!(counter.load(Ordering::SeqCst), JOBS);

    wait_until("queue drains and pools recover", || {
        dispatcher.job_queue_depth() == 0
            && dispatcher.free_job_count() == dispatcher.free_job_total()
            && dispatcher.fiber_pool_free() == dispatcher.fiber_pool_total()
    });

    dispatcher.shutdown();
}

#[test]
fn yield_outside_the_fiber_system_is_an_os_yield() {
    let _guard = serialize();
    let dispatcher = Dispatcher::instance();
    dispatcher.init_with(test_config()).unwrap();

    // Called from a plain test thread: must fall back to yielding the OS
    // thread rather than attempting a fiber switch.
    dispatcher.yield_now();

    dispatcher.shutdown();
}
