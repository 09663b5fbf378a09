use super::frame_allocator::{DemandPaging, FramePool, FrameSource, ResidentOnly};
use super::page_table::{PageTables, TableGuard};
use super::pin::{PinSet, PinnedTranslation};
use super::{Ppn, TranslationEntry, Vpn, MAX_VPN};
use crate::config::{ConfigError, PagingMode, VmConfig};
use crate::error::{SwapError, VmError};
use crate::machine::{PhysicalMemory, Tlb};
use crate::swapping::page_replacement::{select_victim, PageReplacementPolicy, RandomEviction};
use crate::swapping::reclaimer::ReclaimSignal;
use crate::swapping::SwapStore;
use crate::sync::intr::hold_interrupts;
use crate::sync::SleepMutex;
use crate::threading::Pid;
use crate::vfs::FileSystem;
use log::{debug, error, info, trace, warn};
use once_cell::race::OnceBox;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vmkern_shared::mem::PAGE_FRAME_SIZE;

/// Owns physical memory and every structure that tracks it: the free frame
/// pool, the page table with its core map, the pin set and the swap file.
///
/// Built once at boot and shared by reference; nothing here is global.
///
/// Lock order: page table, then eviction policy, TLB registry, swap file.
/// The frame pool, pin set, reclaim signal and TLB locks are leaves.
pub struct VirtualMemoryManager {
    config: VmConfig,
    memory: PhysicalMemory,
    frames: FramePool,
    tables: SleepMutex<PageTables>,
    pins: PinSet,
    swap: OnceBox<SwapStore>,
    // Handed to the swap store when it is first needed.
    swap_fs: SleepMutex<Option<Box<dyn FileSystem>>>,
    frame_source: Box<dyn FrameSource>,
    policy: SleepMutex<Box<dyn PageReplacementPolicy>>,
    tlbs: SleepMutex<BTreeMap<Pid, Arc<Tlb>>>,
    reclaim: ReclaimSignal,
    evictions: AtomicUsize,
}

impl VirtualMemoryManager {
    pub fn new(config: VmConfig, swap_fs: Box<dyn FileSystem>) -> Result<Self, ConfigError> {
        Self::with_policy(config, swap_fs, Box::new(RandomEviction::new()))
    }

    pub fn with_policy(
        config: VmConfig,
        swap_fs: Box<dyn FileSystem>,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let frame_source: Box<dyn FrameSource> = match config.paging {
            PagingMode::Demand => Box::new(DemandPaging),
            PagingMode::Resident => Box::new(ResidentOnly),
        };
        info!(
            "virtual memory: {} frames of {PAGE_FRAME_SIZE} bytes, {} paging",
            config.num_phys_pages,
            frame_source.name()
        );
        Ok(Self {
            memory: PhysicalMemory::new(config.num_phys_pages),
            frames: FramePool::new(config.num_phys_pages),
            tables: SleepMutex::new(PageTables::new(config.num_phys_pages)),
            pins: PinSet::new(),
            swap: OnceBox::new(),
            swap_fs: SleepMutex::new(Some(swap_fs)),
            frame_source,
            policy: SleepMutex::new(policy),
            tlbs: SleepMutex::new(BTreeMap::new()),
            reclaim: ReclaimSignal::default(),
            evictions: AtomicUsize::new(0),
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    pub fn pins(&self) -> &PinSet {
        &self.pins
    }

    pub fn frame_source(&self) -> &dyn FrameSource {
        self.frame_source.as_ref()
    }

    /// Signalled whenever the free pool drops below the low water mark.
    pub fn reclaim_signal(&self) -> &ReclaimSignal {
        &self.reclaim
    }

    /// Locks the page table. Pass the guard to the `*_locked` methods.
    pub fn lock_table(&self) -> TableGuard<'_> {
        TableGuard::lock(&self.tables)
    }

    // Frames

    /// A frame for `pid`, evicting another page if the pool is empty and
    /// the paging mode allows it.
    pub fn get_free_frame(&self, pid: Pid) -> Result<Ppn, VmError> {
        let mut table = self.lock_table();
        self.get_free_frame_locked(&mut table, pid)
    }

    pub fn get_free_frame_locked(
        &self,
        table: &mut TableGuard<'_>,
        pid: Pid,
    ) -> Result<Ppn, VmError> {
        let ppn = self.frame_source.get_frame(self, table, pid)?;
        if self.frame_source.uses_swap() && self.frames.free_count() < self.config.low_water_mark {
            self.reclaim.request();
        }
        Ok(ppn)
    }

    /// Returns a frame obtained from [`Self::get_free_frame`] that never got
    /// mapped. Mapped frames are released by unmapping them instead.
    pub fn return_frame(&self, pid: Pid, ppn: Ppn) -> Result<(), VmError> {
        let table = self.lock_table();
        if let Some(owner) = table.owner(ppn) {
            warn!(
                "process {pid} returns frame {ppn}, which backs {}:{:#x}",
                owner.pid, owner.vpn
            );
            return Err(VmError::FrameInUse {
                ppn,
                pid: owner.pid,
                vpn: owner.vpn,
            });
        }
        trace!("process {pid} returns frame {ppn}");
        self.frames.release(ppn)
    }

    // Translations

    /// Backs page `vpn` of `pid` with a fresh zero-filled frame.
    pub fn new_page(&self, pid: Pid, vpn: Vpn, read_only: bool) -> Result<TranslationEntry, VmError> {
        let mut table = self.lock_table();
        self.new_page_locked(&mut table, pid, vpn, read_only)
    }

    /// Like [`Self::new_page`], with the new frame pinned so its contents can
    /// be filled in before it can be evicted.
    pub fn new_page_pinned(
        &self,
        pid: Pid,
        vpn: Vpn,
        read_only: bool,
    ) -> Result<PinnedTranslation<'_>, VmError> {
        let mut table = self.lock_table();
        self.new_page_pinned_locked(&mut table, pid, vpn, read_only)
    }

    pub fn new_page_pinned_locked(
        &self,
        table: &mut TableGuard<'_>,
        pid: Pid,
        vpn: Vpn,
        read_only: bool,
    ) -> Result<PinnedTranslation<'_>, VmError> {
        let entry = self.new_page_locked(table, pid, vpn, read_only)?;
        Ok(self.pin_entry(table, entry))
    }

    pub fn new_page_locked(
        &self,
        table: &mut TableGuard<'_>,
        pid: Pid,
        vpn: Vpn,
        read_only: bool,
    ) -> Result<TranslationEntry, VmError> {
        if vpn > MAX_VPN {
            return Err(VmError::InvalidPage(vpn));
        }
        let ppn = self.get_free_frame_locked(table, pid)?;
        let entry = TranslationEntry::new(vpn, ppn, read_only);
        let mapped = self.memory.zero(ppn).and_then(|()| table.put(pid, entry));
        match mapped {
            Ok(previous) => {
                if let Some(previous) = previous {
                    self.release_replaced(pid, previous)?;
                }
                debug!("new page {pid}:{vpn:#x} in frame {ppn}");
                Ok(entry)
            }
            Err(err) => {
                self.frames.release(ppn)?;
                Err(err)
            }
        }
    }

    /// Records `entry` for `pid`. Its frame must come from
    /// [`Self::get_free_frame`]. A mapping it replaces gives its frame back to
    /// the pool; an entry that is not valid just removes the mapping.
    pub fn put_translation(&self, pid: Pid, entry: TranslationEntry) -> Result<(), VmError> {
        let mut table = self.lock_table();
        if entry.valid() && self.frames.is_free(entry.ppn) {
            warn!(
                "process {pid} maps {:#x} to frame {}, which is not allocated",
                entry.vpn, entry.ppn
            );
            return Err(VmError::FrameNotAllocated(entry.ppn));
        }
        if let Some(previous) = table.put(pid, entry)? {
            if !entry.valid() || previous.ppn != entry.ppn {
                self.release_replaced(pid, previous)?;
            }
        }
        Ok(())
    }

    fn release_replaced(&self, pid: Pid, previous: TranslationEntry) -> Result<(), VmError> {
        if let Some(tlb) = self.tlb_of(pid) {
            tlb.invalidate(previous.vpn);
        }
        self.frames.release(previous.ppn)
    }

    pub fn get_translation(&self, pid: Pid, vpn: Vpn) -> Option<TranslationEntry> {
        self.lock_table().get(pid, vpn)
    }

    /// Looks up a translation and pins its frame in one step, so the frame
    /// cannot be evicted between the lookup and the pin.
    pub fn get_translation_pinned(&self, pid: Pid, vpn: Vpn) -> Option<PinnedTranslation<'_>> {
        let table = self.lock_table();
        let entry = table.get(pid, vpn)?;
        Some(self.pin_entry(&table, entry))
    }

    /// Pins a translation read from `table` while it is still locked.
    pub fn pin_entry(&self, _table: &TableGuard<'_>, entry: TranslationEntry) -> PinnedTranslation<'_> {
        PinnedTranslation {
            entry,
            frame: self.pins.hold(entry.ppn),
        }
    }

    /// Unmaps every page of `pid`, gives the frames back to the pool and
    /// forgets its TLB. Swap slots are kept. Returns the number of frames
    /// released.
    pub fn deallocate_process_memory(&self, pid: Pid) -> usize {
        let _intr = hold_interrupts();
        let entries = self.lock_table().remove_all(pid);
        for entry in &entries {
            if let Err(err) = self.frames.release(entry.ppn) {
                error!("process {pid}: could not release frame {}: {err}", entry.ppn);
            }
        }
        if let Some(tlb) = self.detach_tlb(pid) {
            tlb.invalidate_all();
        }
        debug!("process {pid}: released {} frames", entries.len());
        entries.len()
    }

    // Swap

    /// Brings page `vpn` of `pid` back from swap.
    ///
    /// A resident page is returned as is. `None` means the page was never
    /// swapped out; no frame is used in that case. Only a failure to read
    /// the page's own slot is reported as [`VmError::SwapRead`].
    pub fn load_page_from_swap_locked(
        &self,
        table: &mut TableGuard<'_>,
        pid: Pid,
        vpn: Vpn,
    ) -> Result<Option<TranslationEntry>, VmError> {
        if let Some(entry) = table.get(pid, vpn) {
            return Ok(Some(entry));
        }
        let Some(swap) = self.swap.get() else {
            return Ok(None);
        };
        if !swap.contains(pid, vpn) {
            return Ok(None);
        }

        let ppn = self.get_free_frame_locked(table, pid)?;
        let pin = self.pins.hold(ppn);
        let loaded = swap
            .load_page(&self.memory, pid, vpn, ppn)
            .map_err(|err| match err {
                VmError::Swap(source) => VmError::SwapRead { pid, vpn, source },
                err => err,
            })
            .and_then(|entry| match entry {
                Some(entry) => table.put(pid, entry).map(|_| Some(entry)),
                None => Ok(None),
            });
        drop(pin);
        if !matches!(loaded, Ok(Some(_))) {
            self.frames.release(ppn)?;
        }
        loaded
    }

    pub fn load_page_from_swap(&self, pid: Pid, vpn: Vpn) -> Result<Option<TranslationEntry>, VmError> {
        let mut table = self.lock_table();
        self.load_page_from_swap_locked(&mut table, pid, vpn)
    }

    /// Writes out one resident, unpinned page and returns its frame, which
    /// then belongs to the caller.
    pub fn evict_page(&self, requester: Pid) -> Result<Ppn, VmError> {
        let mut table = self.lock_table();
        self.evict_page_locked(&mut table, requester)
    }

    pub fn evict_page_locked(
        &self,
        table: &mut TableGuard<'_>,
        requester: Pid,
    ) -> Result<Ppn, VmError> {
        if !self.frame_source.uses_swap() {
            return Err(VmError::OutOfMemory);
        }
        let swap = self.initialize_swap()?;
        let victim = {
            let mut policy = self.policy.lock();
            select_victim(&**table, &self.pins, policy.as_mut(), self.config.eviction_rounds)?
        };
        let owner = victim.owner;
        let entry = table.get(owner.pid, owner.vpn).ok_or_else(|| {
            VmError::Inconsistent(format!(
                "frame {} names {}:{:#x}, which is not mapped",
                victim.frame.ppn(),
                owner.pid,
                owner.vpn
            ))
        })?;

        // Drop the cached copy first so the owner faults instead of touching
        // the frame while it is written out.
        if let Some(tlb) = self.tlb_of(owner.pid) {
            if tlb.invalidate(owner.vpn) && owner.pid == requester {
                debug!("process {requester} evicts its own page {:#x}", owner.vpn);
            }
        }
        swap.write_page(&self.memory, owner.pid, &entry)?;
        table.remove(owner.pid, owner.vpn);
        self.evictions.fetch_add(1, Ordering::Relaxed);

        let ppn = victim.frame.ppn();
        debug!(
            "evicted {}:{:#x} from frame {ppn} for process {requester}",
            owner.pid, owner.vpn
        );
        Ok(ppn)
    }

    /// The swap store, created on first use.
    pub fn initialize_swap(&self) -> Result<&SwapStore, VmError> {
        if let Some(swap) = self.swap.get() {
            return Ok(swap);
        }
        let mut swap_fs = self.swap_fs.lock();
        // Another thread may have created it while we waited.
        if let Some(swap) = self.swap.get() {
            return Ok(swap);
        }
        let fs = swap_fs.as_mut().ok_or(SwapError::NoFileSystem)?;
        let file = SwapStore::create(&mut **fs, &self.config.swap_file)?;
        let fs = swap_fs.take().ok_or(SwapError::NoFileSystem)?;
        let swap = SwapStore::new(fs, file, &self.config.swap_file);
        Ok(self.swap.get_or_init(|| Box::new(swap)))
    }

    pub fn swap_exists(&self) -> bool {
        self.swap.get().is_some_and(SwapStore::is_open)
    }

    pub fn swap_contains(&self, pid: Pid, vpn: Vpn) -> bool {
        self.swap.get().is_some_and(|swap| swap.contains(pid, vpn))
    }

    // TLBs

    pub fn attach_tlb(&self, pid: Pid, tlb: Arc<Tlb>) {
        self.tlbs.lock().insert(pid, tlb);
    }

    pub fn detach_tlb(&self, pid: Pid) -> Option<Arc<Tlb>> {
        self.tlbs.lock().remove(&pid)
    }

    fn tlb_of(&self, pid: Pid) -> Option<Arc<Tlb>> {
        self.tlbs.lock().get(&pid).cloned()
    }

    // Statistics

    pub fn free_frame_count(&self) -> usize {
        self.frames.free_count()
    }

    pub fn resident_page_count(&self) -> usize {
        self.lock_table().resident_count()
    }

    pub fn swap_slot_count(&self) -> usize {
        self.swap.get().map_or(0, SwapStore::slot_count)
    }

    pub fn pinned_frame_count(&self) -> usize {
        self.pins.pinned_count()
    }

    pub fn eviction_count(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Verifies that the page table and core map agree and that no mapped
    /// frame is also in the free pool.
    pub fn check_consistency(&self) -> Result<(), VmError> {
        let table = self.lock_table();
        table.check_consistency()?;
        if let Some(ppn) = table.mapped_frames().find(|&ppn| self.frames.is_free(ppn)) {
            return Err(VmError::Inconsistent(format!(
                "frame {ppn} is both mapped and free"
            )));
        }
        Ok(())
    }

    /// Deletes the swap file. Called once at shutdown.
    pub fn terminate(&self) -> Result<(), VmError> {
        self.tlbs.lock().clear();
        if let Some(swap) = self.swap.get() {
            swap.terminate()?;
        }
        info!(
            "virtual memory shut down after {} evictions",
            self.eviction_count()
        );
        Ok(())
    }
}
