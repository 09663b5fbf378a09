use super::{SleepMutexGuard, TicketMutex};
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, Thread};

struct Sleeper {
    thread: Thread,
    woken: Arc<AtomicBool>,
}

/// A condition variable paired with a [`SleepMutex`](super::SleepMutex).
///
/// A waiter is queued before its mutex is released, so a notification sent
/// by a thread that took the mutex afterwards is never lost.
#[derive(Default)]
pub struct Condvar {
    sleepers: TicketMutex<VecDeque<Sleeper>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            sleepers: TicketMutex::new(VecDeque::new()),
        }
    }

    /// Releases the mutex held by `guard`, sleeps until notified, and takes
    /// the mutex again.
    pub fn wait<'a, T: ?Sized>(&self, guard: SleepMutexGuard<'a, T>) -> SleepMutexGuard<'a, T> {
        let mutex = SleepMutexGuard::mutex(&guard);
        let woken = Arc::new(AtomicBool::new(false));
        self.sleepers.lock().push_back(Sleeper {
            thread: thread::current(),
            woken: woken.clone(),
        });
        drop(guard);

        while !woken.load(Ordering::Acquire) {
            thread::park();
        }
        mutex.lock()
    }

    /// Wakes the longest waiting thread, if any.
    pub fn notify_one(&self) {
        if let Some(sleeper) = self.sleepers.lock().pop_front() {
            sleeper.wake();
        }
    }

    pub fn notify_all(&self) {
        let sleepers = core::mem::take(&mut *self.sleepers.lock());
        for sleeper in sleepers {
            sleeper.wake();
        }
    }
}

impl Sleeper {
    fn wake(self) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}
