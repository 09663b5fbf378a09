use crate::sync::mutex::TicketMutex;
use crate::threading::{current_tid, AtomicTid, Tid};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};
use std::collections::VecDeque;
use std::thread::{self, Thread};

/// A blocking lock. Waiters are queued and parked instead of spinning, and
/// ownership is handed straight to the head of the queue on unlock.
pub struct SleepMutex<T: ?Sized> {
    holding_thread: AtomicTid,
    wait_queue: TicketMutex<VecDeque<Waiter>>,
    data: UnsafeCell<T>,
}

struct Waiter {
    tid: Tid,
    thread: Thread,
}

pub struct SleepMutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a SleepMutex<T>,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for SleepMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepMutex<T> {}

unsafe impl<T: ?Sized + Sync> Sync for SleepMutexGuard<'_, T> {}

impl<'a, T: ?Sized> SleepMutexGuard<'a, T> {
    /// The mutex this guard holds, for relocking after a condition wait.
    pub(crate) fn mutex(guard: &Self) -> &'a SleepMutex<T> {
        guard.mutex
    }
}

// Ensure mutex is released if dropped (such as in the event of a panic)
impl<'a, T: ?Sized> Drop for SleepMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<'a, T: ?Sized + fmt::Debug> fmt::Debug for SleepMutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: ?Sized> Deref for SleepMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard exists only while this thread holds the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SleepMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard exists only while this thread holds the mutex.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + Default> Default for SleepMutex<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T> From<T> for SleepMutex<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T> SleepMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            holding_thread: AtomicTid::new(0),
            wait_queue: TicketMutex::new(VecDeque::new()),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SleepMutex<T> {
    /// Blocks the calling thread until the mutex is free.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already holds the mutex.
    #[must_use = "Mutex is released when guard falls out of scope."]
    pub fn lock(&self) -> SleepMutexGuard<T> {
        let current_tid = current_tid();
        let mut queued = false;

        loop {
            // If no thread is holding the mutex, grab it.
            if self
                .holding_thread
                .compare_exchange(0, current_tid, AcqRel, Acquire)
                .is_ok()
            {
                if queued {
                    // Woken spuriously and won the race; leave the queue so
                    // unlock() does not hand the mutex to us a second time.
                    self.wait_queue
                        .lock()
                        .retain(|waiter| waiter.tid != current_tid);
                }
                break;
            }
            // holding_thread is set to current_tid by unlock() when it hands
            // the mutex over to us.
            if self.holding_thread.load(Acquire) == current_tid {
                assert!(queued, "SleepMutex locked twice by thread {current_tid}");
                break;
            }

            let mut wait_queue = self.wait_queue.lock();
            // unlock() clears holding_thread with the queue held, so a free
            // mutex seen here will not be handed to anyone else.
            if self.holding_thread.load(Acquire) == 0 {
                continue;
            }
            if !wait_queue.iter().any(|waiter| waiter.tid == current_tid) {
                wait_queue.push_back(Waiter {
                    tid: current_tid,
                    thread: thread::current(),
                });
            }
            queued = true;
            drop(wait_queue);
            thread::park();
        }

        SleepMutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let mut wait_queue = self.wait_queue.lock();
        match wait_queue.pop_front() {
            None => {
                self.holding_thread.store(0, Release);
            }
            Some(next) => {
                self.holding_thread.store(next.tid, Release);
                next.thread.unpark();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holding_thread.load(Acquire) != 0
    }

    /// Whether the calling thread is the one holding the mutex.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holding_thread.load(Acquire) == current_tid()
    }

    pub fn try_lock(&self) -> Option<SleepMutexGuard<T>> {
        self.holding_thread
            .compare_exchange(0, current_tid(), AcqRel, Acquire)
            .ok()
            .map(|_| SleepMutexGuard { mutex: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lock_and_try_lock() {
        let mutex = SleepMutex::new(Vec::new());
        {
            let mut guard = mutex.lock();
            guard.push(1);
            assert!(mutex.is_locked());
            assert!(mutex.is_held_by_current_thread());
            assert!(mutex.try_lock().is_none());
        }
        assert!(!mutex.is_locked());
        mutex.try_lock().unwrap().push(2);
        assert_eq!(mutex.into_inner(), vec![1, 2]);
    }

    #[test]
    fn contended_increments() {
        let mutex = Arc::new(SleepMutex::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let mut guard = mutex.lock();
                        let value = *guard;
                        thread::yield_now();
                        *guard = value + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 4000);
    }

    #[test]
    fn waiter_is_woken_on_unlock() {
        let mutex = Arc::new(SleepMutex::new(false));
        let guard = mutex.lock();
        let waiter = {
            let mutex = mutex.clone();
            thread::spawn(move || *mutex.lock())
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        *mutex.lock() = true;
        // The waiter either saw the value before or after our write, but it
        // must not hang.
        let _ = waiter.join().unwrap();
        assert!(*mutex.lock());
    }

    #[test]
    #[should_panic(expected = "locked twice")]
    fn relocking_panics() {
        let mutex = SleepMutex::new(());
        let _first = mutex.lock();
        let _second = mutex.lock();
    }
}
