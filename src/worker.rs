//! Worker threads: one OS thread per scheduler loop.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::Error;
use crate::Result;

////////////////////////////////////////////////////////////////////////////////
// WorkerState
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle states of a [`WorkerThread`].
///
/// Transitions are monotone within one start/stop cycle:
/// `None → Starting → Running → Stopping → Done`, after which the worker
/// may be started again.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Between construction and [`WorkerThread::start`].
    None = 0,
    /// The OS thread is being spawned; the scheduler loop is not ready yet.
    Starting = 1,
    /// The scheduler loop is processing work.
    Running = 2,
    /// [`WorkerThread::stop`] was called; the loop will exit at the top of
    /// its next iteration.
    Stopping = 3,
    /// The scheduler loop has exited and the thread is gone.
    Done = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Done,
            _ => unreachable!("invalid worker state {}", value),
        }
    }
}

/// State cell shared between a [`WorkerThread`] and its scheduler loop.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    state: AtomicU8,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::None as u8),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `Starting → Running`, refused if a stop raced in first. Keeps the
    /// state machine monotone: a `Stopping` observed before the loop ever
    /// ran must not be overwritten back to `Running`.
    pub(crate) fn try_begin_running(&self) -> bool {
        self.state
            .compare_exchange(
                WorkerState::Starting as u8,
                WorkerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

////////////////////////////////////////////////////////////////////////////////
// WorkerThread
////////////////////////////////////////////////////////////////////////////////

/// One OS thread bound to the dispatcher's scheduler loop, optionally
/// pinned to a logical core.
#[derive(Debug)]
pub struct WorkerThread {
    index: usize,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl WorkerThread {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            shared: Arc::new(WorkerShared::new()),
            handle: None,
            last_error: None,
        }
    }

    /// Current state of the worker's lifecycle machine.
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Position of this worker in the dispatcher's worker set.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Text of the most recent start failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Spawns the OS thread running the dispatcher's scheduler loop and,
    /// if `core` is given, pins it to that logical core.
    ///
    /// On spawn or affinity failure the worker is returned to the `None`
    /// state and the OS error is recorded before the error is returned.
    pub(crate) fn start(&mut self, core: Option<usize>) -> Result<()> {
        let state = self.state();
        assert!(
            matches!(state, WorkerState::None | WorkerState::Done),
            "worker {} started from state {:?}",
            self.index,
            state,
        );
        self.shared.set_state(WorkerState::Starting);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("weft-worker-{}", self.index))
            .spawn(move || crate::dispatcher::scheduler(shared));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                self.shared.set_state(WorkerState::None);
                let err = Error::WorkerStart {
                    worker: self.index,
                    source,
                };
                self.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        if let Some(core) = core {
            if let Err(source) = pin_to_core(&handle, core) {
                // The thread is up but in the wrong place; tear it down and
                // report the start as failed.
                self.handle = Some(handle);
                self.stop();
                self.shared.set_state(WorkerState::None);
                let err = Error::WorkerAffinity {
                    worker: self.index,
                    core,
                    source,
                };
                self.last_error = Some(err.to_string());
                return Err(err);
            }
            log::debug!("worker {} pinned to core {}", self.index, core);
        }

        self.handle = Some(handle);
        Ok(())
    }

    /// Signals the scheduler loop to exit and waits for the thread to
    /// finish. Idempotent: stopping a worker that is already `Done` (or was
    /// never started) does nothing.
    pub(crate) fn stop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        if self.shared.state() != WorkerState::Done {
            self.shared.set_state(WorkerState::Stopping);
        }
        if handle.join().is_err() {
            log::warn!("worker {} thread terminated by a panic", self.index);
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(handle: &JoinHandle<()>, core: usize) -> std::result::Result<(), io::Error> {
    use std::os::unix::thread::JoinHandleExt;

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let rc = libc::pthread_setaffinity_np(
            handle.as_pthread_t(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_handle: &JoinHandle<()>, core: usize) -> std::result::Result<(), io::Error> {
    log::debug!("core affinity is not supported on this platform (core {})", core);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{WorkerState, WorkerThread};
    use std::time::{Duration, Instant};

    fn wait_for_state(worker: &WorkerThread, state: WorkerState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.state() != state {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
            std::thread::yield_now();
        }
    }

    #[test]
    fn start_stop_cycle() {
        let mut worker = WorkerThread::new(0);
        assert_eq!(worker.state(), WorkerState::None);

        worker.start(None).unwrap();
        wait_for_state(&worker, WorkerState::Running);

        worker.stop();
        assert_eq!(worker.state(), WorkerState::Done);

        // Stop is idempotent on a worker that is already done.
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Done);

        // Done workers are eligible for a restart.
        worker.start(None).unwrap();
        wait_for_state(&worker, WorkerState::Running);
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Done);
    }
}
