use crate::error::{FaultError, VmError};
use crate::machine::Tlb;
use crate::mem::{PinnedTranslation, TableGuard, TranslationEntry, VirtualMemoryManager, Vpn};
use crate::sync::intr::hold_interrupts;
use crate::threading::Pid;
use log::{debug, error, info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vmkern_shared::mem::PAGE_FRAME_SIZE;
use vmkern_shared::paging::VirtualAddress;

/// Called with the pid and exit status when a fault kills a process.
pub type TerminationHook = Arc<dyn Fn(Pid, i32) + Send + Sync>;

/// Exit status of a process killed by an unresolvable fault.
pub const FAULT_EXIT_STATUS: i32 = -1;

/// The virtual memory side of a user process: its TLB, its stack range and
/// the fault handler that pages its memory in.
pub struct VmProcess {
    pid: Pid,
    vm: Arc<VirtualMemoryManager>,
    tlb: Arc<Tlb>,
    stack_top: Vpn,
    stack_pages: u32,
    on_fatal_fault: TerminationHook,
    exited: AtomicBool,
}

impl VmProcess {
    /// Creates the process and registers its TLB with the manager so
    /// evictions can shoot entries down.
    pub fn new(
        pid: Pid,
        vm: Arc<VirtualMemoryManager>,
        stack_top: Vpn,
        on_fatal_fault: TerminationHook,
    ) -> Self {
        let tlb = Arc::new(Tlb::new(vm.config().tlb_entries));
        vm.attach_tlb(pid, tlb.clone());
        let stack_pages = vm.config().stack_pages;
        Self {
            pid,
            vm,
            tlb,
            stack_top,
            stack_pages,
            on_fatal_fault,
            exited: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn stack_top(&self) -> Vpn {
        self.stack_top
    }

    /// The stack grows down from `stack_top` to `stack_top - stack_pages`,
    /// both ends included.
    pub fn is_stack_page(&self, vpn: Vpn) -> bool {
        self.stack_top
            .checked_sub(vpn)
            .is_some_and(|depth| depth <= self.stack_pages)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), FaultError> {
        if self.has_exited() {
            return Err(FaultError::Exited(self.pid));
        }
        Ok(())
    }

    /// Backs `first_vpn..` with fresh pages holding `contents`. The tail of
    /// the last page is left zeroed. Returns the number of pages mapped.
    pub fn load_section(
        &self,
        first_vpn: Vpn,
        contents: &[u8],
        read_only: bool,
    ) -> Result<usize, FaultError> {
        let mut pages = 0;
        for (index, chunk) in contents.chunks(PAGE_FRAME_SIZE).enumerate() {
            let vpn = u32::try_from(index)
                .ok()
                .and_then(|index| first_vpn.checked_add(index))
                .ok_or(VmError::InvalidPage(first_vpn))?;
            let page = {
                let mut table = self.vm.lock_table();
                self.ensure_running()?;
                self.vm
                    .new_page_pinned_locked(&mut table, self.pid, vpn, read_only)?
            };
            self.vm.memory().write(page.entry.ppn, 0, chunk)?;
            pages += 1;
        }
        debug!(
            "process {}: loaded {} bytes at page {first_vpn:#x} ({pages} pages)",
            self.pid,
            contents.len()
        );
        Ok(pages)
    }

    /// Maps the topmost stack page. Deeper pages are created on demand.
    pub fn allocate_stack(&self) -> Result<TranslationEntry, FaultError> {
        let mut table = self.vm.lock_table();
        self.ensure_running()?;
        Ok(self
            .vm
            .new_page_locked(&mut table, self.pid, self.stack_top, false)?)
    }

    /// Resolves a TLB miss at `vaddr` and installs the translation.
    ///
    /// A fault the process cannot survive runs the termination hook before
    /// the error is returned.
    pub fn handle_translation_fault(&self, vaddr: u32) -> Result<(), FaultError> {
        let vpn = VirtualAddress::new_with_raw_value(vaddr).vpn();
        trace!("process {}: TLB miss at {vaddr:#010x}", self.pid);
        self.resolve(vpn, |_, _| ())
    }

    /// Finds or creates the page, installs it in the TLB and runs `then`
    /// while the page table is still locked.
    fn resolve<T>(
        &self,
        vpn: Vpn,
        then: impl FnOnce(&mut TableGuard<'_>, TranslationEntry) -> T,
    ) -> Result<T, FaultError> {
        let resolved = {
            let _intr = hold_interrupts();
            let mut table = self.vm.lock_table();
            // exit() frees the frames under this lock, so check after taking it.
            self.ensure_running()
                .and_then(|()| self.fault_in_locked(&mut table, vpn))
                .map(|entry| {
                    self.tlb.install(entry);
                    then(&mut table, entry)
                })
        };
        if let Err(err) = &resolved {
            if err.kills_process() {
                error!("{err}; terminating process {}", self.pid);
                (self.on_fatal_fault)(self.pid, FAULT_EXIT_STATUS);
            }
        }
        resolved
    }

    fn fault_in_locked(
        &self,
        table: &mut TableGuard<'_>,
        vpn: Vpn,
    ) -> Result<TranslationEntry, FaultError> {
        if let Some(entry) = table.get(self.pid, vpn) {
            return Ok(entry);
        }
        match self.vm.load_page_from_swap_locked(table, self.pid, vpn) {
            Ok(Some(entry)) => {
                debug!("process {}: paged in {vpn:#x} from swap", self.pid);
                return Ok(entry);
            }
            Ok(None) => {}
            Err(VmError::SwapRead { source, .. }) => {
                return Err(FaultError::PageIn {
                    pid: self.pid,
                    vpn,
                    source,
                })
            }
            Err(err) => return Err(FaultError::Kernel(err)),
        }
        if self.is_stack_page(vpn) {
            debug!("process {}: stack grows to page {vpn:#x}", self.pid);
            return Ok(self.vm.new_page_locked(table, self.pid, vpn, false)?);
        }
        Err(FaultError::Segfault { pid: self.pid, vpn })
    }

    /// Makes `vpn` resident and pins it, as the processor would on a load
    /// or store: a TLB hit uses the cached translation, a miss faults.
    fn pin_page(&self, vpn: Vpn, write: bool) -> Result<PinnedTranslation<'_>, FaultError> {
        if self.tlb.lookup(vpn).is_some() {
            if let Some(page) = self.vm.get_translation_pinned(self.pid, vpn) {
                self.tlb.mark_accessed(vpn, write);
                return Ok(page);
            }
            // Evicted since the lookup.
            self.tlb.invalidate(vpn);
        }
        self.resolve(vpn, |table, entry| {
            let entry = table.mark_accessed(self.pid, vpn, write).unwrap_or(entry);
            self.tlb.mark_accessed(vpn, write);
            self.vm.pin_entry(table, entry)
        })
    }

    /// Copies from the process's memory at `vaddr` into `buf`, paging in
    /// as needed. Stops early at the top of the address space.
    pub fn read_virtual_memory(&self, vaddr: u32, buf: &mut [u8]) -> Result<usize, FaultError> {
        self.ensure_running()?;
        let mut done = 0;
        while done < buf.len() {
            let Some(addr) = u32::try_from(done)
                .ok()
                .and_then(|done| vaddr.checked_add(done))
            else {
                break;
            };
            let addr = VirtualAddress::new_with_raw_value(addr);
            let page = self.pin_page(addr.vpn(), false)?;
            done += self
                .vm
                .memory()
                .read(page.entry.ppn, addr.page_offset(), &mut buf[done..])?;
        }
        Ok(done)
    }

    /// Copies `data` into the process's memory at `vaddr`. Stops at the
    /// first read-only page and returns the number of bytes written.
    pub fn write_virtual_memory(&self, vaddr: u32, data: &[u8]) -> Result<usize, FaultError> {
        self.ensure_running()?;
        let mut done = 0;
        while done < data.len() {
            let Some(addr) = u32::try_from(done)
                .ok()
                .and_then(|done| vaddr.checked_add(done))
            else {
                break;
            };
            let addr = VirtualAddress::new_with_raw_value(addr);
            let page = self.pin_page(addr.vpn(), true)?;
            if page.entry.read_only() {
                debug!(
                    "process {}: write stopped at read-only page {:#x}",
                    self.pid,
                    addr.vpn()
                );
                break;
            }
            done += self
                .vm
                .memory()
                .write(page.entry.ppn, addr.page_offset(), &data[done..])?;
        }
        Ok(done)
    }

    /// Called when the process is switched out. Usage bits cached in the
    /// TLB are folded back into the page table before it is flushed.
    pub fn save_state(&self) {
        let _intr = hold_interrupts();
        let mut table = self.vm.lock_table();
        for index in 0..self.tlb.len() {
            let Some(cached) = self.tlb.read_entry(index) else {
                continue;
            };
            if cached.valid() && cached.used() {
                table.mark_accessed(self.pid, cached.vpn, cached.dirty());
            }
        }
        drop(table);
        self.tlb.invalidate_all();
    }

    /// Called when the process is switched back in.
    pub fn restore_state(&self) {
        self.tlb.invalidate_all();
    }

    /// Releases every frame the process holds. Later calls do nothing.
    /// Returns the number of frames released.
    pub fn exit(&self) -> usize {
        if self.exited.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let released = self.vm.deallocate_process_memory(self.pid);
        info!("process {} exited, {released} frames released", self.pid);
        released
    }
}

impl core::fmt::Debug for VmProcess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmProcess")
            .field("pid", &self.pid)
            .field("stack_top", &self.stack_top)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}
