//! Bounded pools of pre-allocated objects.
//!
//! The dispatcher never allocates on the dispatch path: jobs and fibers are
//! recycled through a [`ResourcePool`]. A pool owns every object it ever
//! allocated and hands out non-owning pointers; callers return them with
//! [`ResourcePool::release`] when done.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::sync::{LockedQueue, SpinLock};

////////////////////////////////////////////////////////////////////////////////
// ResourcePool
////////////////////////////////////////////////////////////////////////////////

/// A thread-safe free list of pre-allocated `T` objects with optional
/// proportional growth.
///
/// Objects are boxed individually so their addresses stay stable while the
/// pool grows; a pointer handed out by [`get`] remains valid until the pool
/// itself is dropped, regardless of later growth.
///
/// With a growth factor of `0` the pool is fixed-size and [`get`] returns
/// `None` on exhaustion. With a positive factor an exhausted pool allocates
/// `max(1, floor(total * factor))` new objects under the resize lock and the
/// request is satisfied from the fresh batch.
///
/// [`get`]: Self::get
#[derive(Debug)]
pub struct ResourcePool<T> {
    /// Owns every object the pool ever allocated. Append-only; guarded by
    /// `resize_lock`.
    items: UnsafeCell<Vec<Box<T>>>,
    free: LockedQueue<NonNull<T>>,
    resize_lock: SpinLock,
    total: AtomicUsize,
    /// Bit pattern of an `f32`.
    growth_factor: AtomicU32,
    #[cfg(debug_assertions)]
    stats_lock: SpinLock,
    #[cfg(debug_assertions)]
    stats: UnsafeCell<PoolStats>,
}

#[cfg(debug_assertions)]
#[derive(Debug, Default)]
struct PoolStats {
    in_use: isize,
    high_water: isize,
}

// `items` is only mutated under `resize_lock`, the free list is internally
// synchronized, and the objects themselves are only reachable through one
// owner at a time (either the free list or the single caller `get` handed
// the pointer to).
unsafe impl<T: Send + Sync> Send for ResourcePool<T> {}
unsafe impl<T: Send + Sync> Sync for ResourcePool<T> {}

impl<T> ResourcePool<T> {
    /// Creates an empty pool with growth disabled.
    ///
    /// Populate it with [`grow`] and enable dynamic expansion with
    /// [`set_growth_factor`] if desired.
    ///
    /// [`grow`]: Self::grow
    /// [`set_growth_factor`]: Self::set_growth_factor
    pub fn new() -> Self {
        Self {
            items: UnsafeCell::new(Vec::new()),
            free: LockedQueue::new(),
            resize_lock: SpinLock::new(),
            total: AtomicUsize::new(0),
            growth_factor: AtomicU32::new(0f32.to_bits()),
            #[cfg(debug_assertions)]
            stats_lock: SpinLock::new(),
            #[cfg(debug_assertions)]
            stats: UnsafeCell::new(PoolStats::default()),
        }
    }

    /// Returns a previously handed-out object to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from this pool's [`get`] and must not be
    /// used by the caller afterwards.
    ///
    /// [`get`]: Self::get
    pub unsafe fn release(&self, ptr: NonNull<T>) {
        #[cfg(debug_assertions)]
        {
            self.stats_lock.lock();
            (*self.stats.get()).in_use -= 1;
            self.stats_lock.unlock();
        }
        self.free.push(ptr);
    }

    /// Total number of objects the pool has allocated so far.
    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Number of objects currently sitting on the free list.
    ///
    /// Advisory under concurrent `get`/`release` traffic.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Current growth factor. `0.0` means the pool never grows.
    pub fn growth_factor(&self) -> f32 {
        f32::from_bits(self.growth_factor.load(Ordering::Relaxed))
    }

    /// Sets the proportional growth factor applied when [`get`] finds the
    /// free list empty.
    ///
    /// [`get`]: Self::get
    pub fn set_growth_factor(&self, factor: f32) {
        self.growth_factor.store(factor.to_bits(), Ordering::Relaxed);
    }

    /// Pointer to the `index`-th allocated object, or `None` past the end.
    ///
    /// Index order is allocation order. The object may be free or in use;
    /// this accessor is for diagnostics only.
    pub fn at(&self, index: usize) -> Option<NonNull<T>> {
        self.resize_lock.lock();
        let ptr = unsafe { &mut *self.items.get() }
            .get_mut(index)
            .map(|item| NonNull::from(item.as_mut()));
        self.resize_lock.unlock();
        ptr
    }

    /// Largest number of objects ever observed in use at once.
    #[cfg(debug_assertions)]
    pub fn high_water_mark(&self) -> isize {
        self.stats_lock.lock();
        let mark = unsafe { &*self.stats.get() }.high_water;
        self.stats_lock.unlock();
        mark
    }

    #[cfg(debug_assertions)]
    fn note_acquired(&self) {
        self.stats_lock.lock();
        let stats = unsafe { &mut *self.stats.get() };
        stats.in_use += 1;
        if stats.in_use > stats.high_water {
            stats.high_water = stats.in_use;
        }
        self.stats_lock.unlock();
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn note_acquired(&self) {}
}

impl<T: Default> ResourcePool<T> {
    /// Allocates `count` default-constructed objects and adds them to the
    /// free list. Returns the new total count.
    pub fn grow(&self, count: usize) -> usize {
        self.resize_lock.lock();
        let total = self.grow_locked(count);
        self.resize_lock.unlock();
        total
    }

    /// Takes one object off the free list.
    ///
    /// On an empty free list with a positive growth factor the pool expands
    /// by `max(1, floor(total * factor))` and the pop is retried; with the
    /// factor at `0.0` exhaustion yields `None`.
    pub fn get(&self) -> Option<NonNull<T>> {
        loop {
            if let Some(ptr) = self.free.pop() {
                self.note_acquired();
                return Some(ptr);
            }

            let factor = self.growth_factor();
            if factor <= 0.0 {
                return None;
            }

            // Another caller may have grown the pool or released an object
            // while we were inspecting it, so re-check the free list under
            // the resize lock before allocating.
            self.resize_lock.lock();
            if self.free.is_empty() {
                let total = self.total.load(Ordering::Relaxed);
                let additional = ((total as f32 * factor) as usize).max(1);
                self.grow_locked(additional);
            }
            self.resize_lock.unlock();
        }
    }

    /// Grows the pool while the resize lock is already held.
    fn grow_locked(&self, count: usize) -> usize {
        let items = unsafe { &mut *self.items.get() };
        items.reserve(count);
        for _ in 0..count {
            let mut item = Box::new(T::default());
            let ptr = NonNull::from(item.as_mut());
            items.push(item);
            self.free.push(ptr);
        }
        let total = self.total.fetch_add(count, Ordering::Relaxed) + count;
        log::debug!("resource pool grew by {} to {} objects", count, total);
        total
    }
}

impl<T> Default for ResourcePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ResourcePool;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct TestResource {
        payload: u64,
    }

    #[test]
    fn grow_then_balanced_get_release() {
        const POOL_SIZE: usize = 100;

        let pool = ResourcePool::<TestResource>::new();
        pool.grow(POOL_SIZE);
        assert_eq!(pool.free_count(), POOL_SIZE);
        assert_eq!(pool.total_count(), POOL_SIZE);

        let taken: Vec<_> = (0..POOL_SIZE / 2).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.total_count(), POOL_SIZE);
        assert_eq!(pool.free_count(), POOL_SIZE / 2);

        for ptr in taken {
            unsafe { pool.release(ptr) };
        }
        assert_eq!(pool.free_count(), POOL_SIZE);
        assert_eq!(pool.total_count(), POOL_SIZE);
    }

    #[test]
    fn exhaustion_without_growth() {
        let pool = ResourcePool::<TestResource>::new();
        pool.grow(2);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());

        unsafe {
            pool.release(a);
            pool.release(b);
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn proportional_growth_on_empty_free_list() {
        let pool = ResourcePool::<TestResource>::new();
        pool.grow(5);
        pool.set_growth_factor(1.5);

        let mut taken: Vec<_> = (0..5).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.total_count(), 5);

        // The sixth get grows the pool by floor(5 * 1.5) = 7.
        taken.push(pool.get().unwrap());
        assert_eq!(pool.total_count(), 12);
        assert_eq!(pool.free_count(), 6);

        for ptr in taken {
            unsafe { pool.release(ptr) };
        }
        assert_eq!(pool.free_count(), 12);
    }

    #[test]
    fn pointers_stay_valid_across_growth() {
        let pool = ResourcePool::<TestResource>::new();
        pool.grow(1);
        pool.set_growth_factor(1.0);

        let first = pool.get().unwrap();
        unsafe { (*first.as_ptr()).payload = 42 };

        // Force several rounds of growth while `first` is outstanding.
        let mut taken = Vec::new();
        for _ in 0..64 {
            taken.push(pool.get().unwrap());
        }

        assert_eq!(unsafe { (*first.as_ptr()).payload }, 42);

        unsafe {
            pool.release(first);
            for ptr in taken {
                pool.release(ptr);
            }
        }
        assert_eq!(pool.free_count(), pool.total_count());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn high_water_mark_tracks_peak_usage() {
        let pool = ResourcePool::<TestResource>::new();
        pool.grow(10);

        let taken: Vec<_> = (0..7).map(|_| pool.get().unwrap()).collect();
        for ptr in taken {
            unsafe { pool.release(ptr) };
        }
        let one_more = pool.get().unwrap();
        unsafe { pool.release(one_more) };

        assert_eq!(pool.high_water_mark(), 7);
    }

    #[test]
    fn indexed_access_covers_all_allocations() {
        let pool = ResourcePool::<TestResource>::new();
        pool.grow(3);

        assert!(pool.at(0).is_some());
        assert!(pool.at(2).is_some());
        assert!(pool.at(3).is_none());
    }
}
