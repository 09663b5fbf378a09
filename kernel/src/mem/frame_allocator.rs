use super::{Ppn, TableGuard, VirtualMemoryManager};
use crate::error::VmError;
use crate::sync::SleepMutex;
use crate::threading::Pid;
use log::{debug, warn};

struct FreeFrames {
    free: Vec<Ppn>,
    /// `allocated[ppn]` is set while the frame is outside the pool.
    allocated: Box<[bool]>,
}

/// The pool of physical frames not backing any translation.
pub struct FramePool {
    inner: SleepMutex<FreeFrames>,
}

impl FramePool {
    /// A pool holding every frame of a machine with `num_frames` frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: SleepMutex::new(FreeFrames {
                // Reversed so frames are handed out lowest first.
                free: (0..num_frames).rev().collect(),
                allocated: vec![false; num_frames].into_boxed_slice(),
            }),
        }
    }

    pub fn allocate(&self) -> Option<Ppn> {
        let mut frames = self.inner.lock();
        let ppn = frames.free.pop()?;
        frames.allocated[ppn] = true;
        Some(ppn)
    }

    /// Puts a frame back in the pool. Releasing a frame that is already free
    /// is ignored.
    pub fn release(&self, ppn: Ppn) -> Result<(), VmError> {
        let mut frames = self.inner.lock();
        match frames.allocated.get(ppn) {
            None => Err(VmError::InvalidFrame(ppn)),
            Some(false) => {
                warn!("frame {ppn} released twice");
                Ok(())
            }
            Some(true) => {
                frames.allocated[ppn] = false;
                frames.free.push(ppn);
                Ok(())
            }
        }
    }

    pub fn is_free(&self, ppn: Ppn) -> bool {
        self.inner
            .lock()
            .allocated
            .get(ppn)
            .is_some_and(|allocated| !allocated)
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

/// Where frames come from, and what to do when the pool runs dry.
///
/// Chosen once when the manager is built.
pub trait FrameSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether pages may be written out to a swap file.
    fn uses_swap(&self) -> bool;

    /// Produces a frame for `requester` after the pool came up empty.
    fn on_exhausted(
        &self,
        vm: &VirtualMemoryManager,
        table: &mut TableGuard<'_>,
        requester: Pid,
    ) -> Result<Ppn, VmError>;

    fn get_frame(
        &self,
        vm: &VirtualMemoryManager,
        table: &mut TableGuard<'_>,
        requester: Pid,
    ) -> Result<Ppn, VmError> {
        match vm.frames().allocate() {
            Some(ppn) => Ok(ppn),
            None => self.on_exhausted(vm, table, requester),
        }
    }
}

/// Every page stays in memory until its process exits.
pub struct ResidentOnly;

impl FrameSource for ResidentOnly {
    fn name(&self) -> &'static str {
        "resident"
    }

    fn uses_swap(&self) -> bool {
        false
    }

    fn on_exhausted(
        &self,
        _vm: &VirtualMemoryManager,
        _table: &mut TableGuard<'_>,
        requester: Pid,
    ) -> Result<Ppn, VmError> {
        warn!("out of frames for process {requester}");
        Err(VmError::OutOfMemory)
    }
}

/// Evicts a resident page to swap when the pool is empty, then retries the
/// allocation once.
pub struct DemandPaging;

impl FrameSource for DemandPaging {
    fn name(&self) -> &'static str {
        "demand"
    }

    fn uses_swap(&self) -> bool {
        true
    }

    fn on_exhausted(
        &self,
        vm: &VirtualMemoryManager,
        table: &mut TableGuard<'_>,
        requester: Pid,
    ) -> Result<Ppn, VmError> {
        debug!("frame pool empty for process {requester}, evicting");
        let ppn = vm.evict_page_locked(table, requester)?;
        vm.frames().release(ppn)?;
        vm.frames().allocate().ok_or(VmError::OutOfMemory)
    }
}
