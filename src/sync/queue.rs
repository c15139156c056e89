//! A spinlock-protected multi-producer multi-consumer FIFO.

use std::cell::UnsafeCell;
use std::collections::VecDeque;

use crate::sync::SpinLock;

////////////////////////////////////////////////////////////////////////////////
// LockedQueue
////////////////////////////////////////////////////////////////////////////////

/// A FIFO queue serialized by a [`SpinLock`].
///
/// Every operation holds the lock for the few instructions it takes to touch
/// the underlying deque, so the queue is safe to use from any number of
/// producers and consumers at once. [`pop`] never blocks: an empty queue
/// simply yields `None`.
///
/// Elements emerge in insertion order. With concurrent producers the
/// interleaving between them is whatever the lock arbitration produced, but
/// for a single producer/consumer pair the queue is strict FIFO.
///
/// [`pop`]: Self::pop
#[derive(Debug, Default)]
pub struct LockedQueue<T> {
    lock: SpinLock,
    items: UnsafeCell<VecDeque<T>>,
}

// The spinlock serializes every access to `items`.
unsafe impl<T: Send> Send for LockedQueue<T> {}
unsafe impl<T: Send> Sync for LockedQueue<T> {}

impl<T> LockedQueue<T> {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            items: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Appends `value` to the tail of the queue.
    pub fn push(&self, value: T) {
        self.lock.lock();
        unsafe { &mut *self.items.get() }.push_back(value);
        self.lock.unlock();
    }

    /// Removes and returns the head of the queue, or `None` if it is empty.
    pub fn pop(&self) -> Option<T> {
        self.lock.lock();
        let value = unsafe { &mut *self.items.get() }.pop_front();
        self.lock.unlock();
        value
    }

    /// Returns the current number of queued elements.
    ///
    /// Advisory under concurrent mutation.
    pub fn len(&self) -> usize {
        self.lock.lock();
        let len = unsafe { &*self.items.get() }.len();
        self.lock.unlock();
        len
    }

    /// Returns `true` if the queue currently holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::LockedQueue;
    use pretty_assertions::assert_eq;

    #[test]
    fn fifo_order_and_len() {
        const COUNT: usize = 100;

        let data: Vec<i32> = (0..COUNT as i32).collect();
        let queue = LockedQueue::new();

        for item in &data {
            queue.push(item);
        }
        assert_eq!(queue.len(), COUNT);

        for i in 0..COUNT / 2 {
            let popped = queue.pop().unwrap();
            assert_eq!(*popped, i as i32);
        }
        assert_eq!(queue.len(), COUNT / 2);
    }

    #[test]
    fn empty_queue() {
        let queue = LockedQueue::<*const i32>::new();
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_producers_drain_completely() {
        use std::sync::Arc;

        const PER_PRODUCER: usize = 500;

        let queue = Arc::new(LockedQueue::new());
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER as u64 {
                        queue.push(p * PER_PRODUCER as u64 + i);
                    }
                })
            })
            .collect();
        for t in producers {
            t.join().unwrap();
        }

        let mut seen = Vec::with_capacity(4 * PER_PRODUCER);
        while let Some(v) = queue.pop() {
            seen.push(v);
        }
        seen.sort_unstable();
        let expected: Vec<u64> = (0..4 * PER_PRODUCER as u64).collect();
        assert_eq!(seen, expected);
    }
}
