//! The platform execution-context primitive.
//!
//! Everything platform-specific about fiber switching is confined to this
//! module, as four operations: create a context with a fresh stack
//! ([`Context::new`]), wrap the calling OS thread's own stack
//! ([`Context::adopt_current`]), transfer execution
//! ([`Context::switch_from`]) and destroy (dropping the [`Context`]). The
//! rest of the crate treats a context as an opaque capability.
//!
//! On Unix this is realized over `libc`'s ucontext family: `getcontext` +
//! `makecontext` to prepare a context on a heap-allocated stack, and
//! `swapcontext` to transfer between two of them.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_uint, c_void};
use std::ptr;

use crate::error::Error;
use crate::Result;

/// Smallest stack a context may be created with. Requests below this are
/// rounded up; the signal-delivery minimum on common targets is well below
/// it.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// The function a fresh context begins executing. It must never return:
/// there is nothing on the context's brand-new stack to return to.
pub type ContextEntry = extern "C" fn(*mut c_void) -> !;

////////////////////////////////////////////////////////////////////////////////
// Context
////////////////////////////////////////////////////////////////////////////////

/// A switchable execution context: a stack plus saved machine state.
///
/// Contexts created with [`new`] own their stack; contexts created with
/// [`adopt_current`] borrow the OS thread's stack and only provide a place
/// for its machine state to be parked while another context runs on the
/// thread.
///
/// The saved state lives in a separate heap allocation, so a `Context` value
/// may be moved freely even while suspended.
///
/// [`new`]: Self::new
/// [`adopt_current`]: Self::adopt_current
#[derive(Debug)]
pub struct Context {
    inner: Box<ContextInner>,
}

struct ContextInner {
    ucp: UnsafeCell<libc::ucontext_t>,
    /// `Some` when the context owns a stack allocated by [`Context::new`];
    /// `None` for adopted threads.
    stack: Option<Box<[u8]>>,
}

impl std::fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextInner")
            .field("owns_stack", &self.stack.is_some())
            .finish_non_exhaustive()
    }
}

// A suspended context is inert data and may be resumed from any thread.
// Resuming the same context from two threads at once is ruled out by the
// scheduler protocol, not by this type.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Allocates a `stack_size`-byte stack and prepares a context that will
    /// begin at `entry(arg)` when first switched to.
    ///
    /// `arg` is passed through untouched; the caller keeps ownership of
    /// whatever it points at, and must keep it alive for as long as the
    /// context can run.
    pub fn new(stack_size: usize, entry: ContextEntry, arg: *mut c_void) -> Result<Self> {
        let mut inner = Box::new(ContextInner {
            ucp: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            stack: None,
        });

        if unsafe { libc::getcontext(inner.ucp.get()) } != 0 {
            return Err(Error::ContextCreate(io::Error::last_os_error()));
        }

        let stack_size = stack_size.max(MIN_STACK_SIZE);
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        unsafe {
            let ucp = &mut *inner.ucp.get();
            ucp.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
            ucp.uc_stack.ss_size = stack_size;
            // An entry never returns, so there is no successor context.
            ucp.uc_link = ptr::null_mut();
        }
        inner.stack = Some(stack);

        // `makecontext` only forwards integer arguments, so the two pointers
        // are split into 32-bit halves and reassembled in the trampoline.
        let (entry_hi, entry_lo) = split(entry as usize);
        let (arg_hi, arg_lo) = split(arg as usize);
        unsafe {
            let trampoline: extern "C" fn() = std::mem::transmute(
                context_trampoline as extern "C" fn(c_uint, c_uint, c_uint, c_uint),
            );
            libc::makecontext(
                inner.ucp.get(),
                trampoline,
                4,
                entry_hi,
                entry_lo,
                arg_hi,
                arg_lo,
            );
        }

        Ok(Self { inner })
    }

    /// Wraps the calling OS thread's stack in a context, making the thread
    /// itself a valid switch target.
    ///
    /// The returned context holds no stack of its own. Its saved state is
    /// only meaningful after some later [`switch_from`] has parked the
    /// thread's execution in it.
    ///
    /// [`switch_from`]: Self::switch_from
    pub fn adopt_current() -> Result<Self> {
        let inner = Box::new(ContextInner {
            ucp: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            stack: None,
        });
        if unsafe { libc::getcontext(inner.ucp.get()) } != 0 {
            return Err(Error::ContextCreate(io::Error::last_os_error()));
        }
        Ok(Self { inner })
    }

    /// Saves the calling execution state into `from` and resumes `self`.
    ///
    /// Returns when some other context switches back into `from`.
    ///
    /// # Safety
    ///
    /// `from` must be the context the caller is actually executing on, and
    /// no other thread may be resuming either context concurrently.
    pub unsafe fn switch_from(&self, from: &Context) {
        let rc = libc::swapcontext(from.inner.ucp.get(), self.inner.ucp.get());
        // swapcontext only fails on invalid arguments, which the fiber
        // layer's ownership protocol rules out.
        debug_assert_eq!(rc, 0, "swapcontext failed");
    }
}

#[inline]
fn split(value: usize) -> (c_uint, c_uint) {
    let value = value as u64;
    ((value >> 32) as c_uint, value as c_uint)
}

#[inline]
fn join(hi: c_uint, lo: c_uint) -> usize {
    (((hi as u64) << 32) | lo as u64) as usize
}

extern "C" fn context_trampoline(entry_hi: c_uint, entry_lo: c_uint, arg_hi: c_uint, arg_lo: c_uint) {
    unsafe {
        let entry: ContextEntry = std::mem::transmute(join(entry_hi, entry_lo));
        let arg = join(arg_hi, arg_lo) as *mut c_void;
        entry(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::{Context, ContextEntry, MIN_STACK_SIZE};
    use std::os::raw::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PingPong {
        main: Context,
        child: Option<Context>,
        entries: AtomicUsize,
    }

    extern "C" fn child_entry(arg: *mut c_void) -> ! {
        let state = unsafe { &*(arg as *const PingPong) };
        loop {
            state.entries.fetch_add(1, Ordering::SeqCst);
            let child = state.child.as_ref().unwrap();
            unsafe { state.main.switch_from(child) };
        }
    }

    #[test]
    fn switch_into_context_and_back() {
        let mut state = Box::new(PingPong {
            main: Context::adopt_current().unwrap(),
            child: None,
            entries: AtomicUsize::new(0),
        });
        let arg = &*state as *const PingPong as *mut c_void;
        state.child = Some(Context::new(MIN_STACK_SIZE, child_entry as ContextEntry, arg).unwrap());

        unsafe { state.child.as_ref().unwrap().switch_from(&state.main) };
        assert_eq!(state.entries.load(Ordering::SeqCst), 1);

        // The suspended context resumes where it left off.
        unsafe { state.child.as_ref().unwrap().switch_from(&state.main) };
        assert_eq!(state.entries.load(Ordering::SeqCst), 2);
    }
}
