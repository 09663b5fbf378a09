//! Background reclamation: keeps a few frames free so that faults rarely
//! have to evict synchronously.

use crate::error::VmError;
use crate::mem::VirtualMemoryManager;
use crate::sync::{Condvar, SleepMutex};
use crate::threading::KERNEL_PID;
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the reclaimer backs off after eviction failed.
const STALL_BACKOFF: Duration = Duration::from_millis(20);

/// Wakes the reclaimer. Requests made while it is busy are remembered, so
/// none is lost.
#[derive(Default)]
pub struct ReclaimSignal {
    requested: SleepMutex<bool>,
    wake: Condvar,
}

impl ReclaimSignal {
    pub fn request(&self) {
        *self.requested.lock() = true;
        self.wake.notify_one();
    }

    /// Blocks until a request arrives and consumes it.
    fn wait(&self) {
        let mut requested = self.requested.lock();
        while !*requested {
            requested = self.wake.wait(requested);
        }
        *requested = false;
    }
}

/// Evicts pages until the free pool is back at the low water mark or
/// nothing is left to evict. Returns the number of frames freed.
///
/// The page table lock is taken per eviction, and the frame pool lock is
/// never held across one.
pub fn reclaim_once(vm: &VirtualMemoryManager) -> Result<usize, VmError> {
    let low_water_mark = vm.config().low_water_mark;
    let mut reclaimed = 0;
    loop {
        let mut table = vm.lock_table();
        if vm.frames().free_count() >= low_water_mark || table.resident_count() == 0 {
            break;
        }
        let ppn = vm.evict_page_locked(&mut table, KERNEL_PID)?;
        vm.frames().release(ppn)?;
        reclaimed += 1;
    }
    Ok(reclaimed)
}

/// Runs [`reclaim_once`] every time the manager signals that frames are
/// running low, until `stop` is set.
pub fn run(vm: &VirtualMemoryManager, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match reclaim_once(vm) {
            Ok(0) => {}
            Ok(reclaimed) => {
                debug!("reclaimer freed {reclaimed} frames");
                thread::yield_now();
            }
            Err(err) => {
                warn!("reclaimer: {err}");
                thread::sleep(STALL_BACKOFF);
            }
        }
        vm.reclaim_signal().wait();
    }
}

/// The running reclaimer thread. Stopped when dropped.
pub struct Reclaimer {
    vm: Arc<VirtualMemoryManager>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn spawn(vm: Arc<VirtualMemoryManager>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new().name("vm-reclaimer".into()).spawn({
            let vm = vm.clone();
            let stop = stop.clone();
            move || run(&vm, &stop)
        })?;
        info!("reclaimer started");
        Ok(Self {
            vm,
            stop,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Asks the thread to finish and waits for it.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.vm.reclaim_signal().request();
        if thread.join().is_err() {
            warn!("reclaimer thread panicked");
        }
        info!("reclaimer stopped");
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}
