use crate::config::{PagingMode, VmConfig};
use crate::error::{BootError, FaultError, VmError};
use crate::mem::{VirtualMemoryManager, Vpn};
use crate::swapping::reclaimer::Reclaimer;
use crate::sync::SleepMutex;
use crate::threading::process_table::ProcessTable;
use crate::threading::{AtomicPid, Pid};
use crate::user_program::process::{TerminationHook, VmProcess};
use crate::vfs::FileSystem;
use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Everything the kernel sets up at boot: the virtual memory manager, the
/// process table and the background reclaimer.
pub struct System {
    vm: Arc<VirtualMemoryManager>,
    processes: Arc<SleepMutex<ProcessTable>>,
    next_pid: AtomicPid,
    reclaimer: SleepMutex<Option<Reclaimer>>,
}

impl System {
    pub fn new(config: VmConfig, swap_fs: Box<dyn FileSystem>) -> Result<Self, BootError> {
        let vm = VirtualMemoryManager::new(config, swap_fs)?;
        Self::with_manager(Arc::new(vm))
    }

    /// Boots around an existing manager. Starts the reclaimer if the
    /// configuration asks for one.
    pub fn with_manager(vm: Arc<VirtualMemoryManager>) -> Result<Self, BootError> {
        let reclaimer = if vm.config().background_reclaim && vm.frame_source().uses_swap() {
            Some(Reclaimer::spawn(vm.clone())?)
        } else {
            None
        };
        info!("kernel started");
        Ok(Self {
            vm,
            processes: Arc::new(SleepMutex::new(ProcessTable::new())),
            next_pid: AtomicPid::new(1),
            reclaimer: SleepMutex::new(reclaimer),
        })
    }

    pub fn vm(&self) -> &Arc<VirtualMemoryManager> {
        &self.vm
    }

    /// Creates a process whose stack grows down from `stack_top`. Nothing is
    /// mapped yet.
    pub fn spawn(&self, stack_top: Vpn) -> Result<Arc<VmProcess>, VmError> {
        if self.vm.config().paging == PagingMode::Demand {
            self.vm.initialize_swap()?;
        }
        let pid = self
            .next_pid
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pid| pid.checked_add(1))
            .map_err(|_| VmError::PidsExhausted)?;

        let on_fatal_fault: TerminationHook = {
            let processes = Arc::downgrade(&self.processes);
            Arc::new(move |pid, status| {
                if let Some(processes) = Weak::upgrade(&processes) {
                    exit_process(&processes, pid, status);
                }
            })
        };
        let process = Arc::new(VmProcess::new(
            pid,
            self.vm.clone(),
            stack_top,
            on_fatal_fault,
        ));
        self.processes.lock().add(process.clone());
        info!("process {pid} created");
        Ok(process)
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<VmProcess>> {
        self.processes.lock().get(pid)
    }

    /// Ends a process and frees its memory. Returns false if it was not
    /// running.
    pub fn exit(&self, pid: Pid, status: i32) -> bool {
        exit_process(&self.processes, pid, status)
    }

    pub fn exit_status(&self, pid: Pid) -> Option<i32> {
        self.processes.lock().exit_status(pid)
    }

    /// Entry point for the trap dispatcher on a TLB miss.
    pub fn handle_translation_fault(&self, pid: Pid, vaddr: u32) -> Result<(), FaultError> {
        // The table lock must be dropped first, the fault may exit the process.
        let process = self.process(pid).ok_or(FaultError::Exited(pid))?;
        process.handle_translation_fault(vaddr)
    }

    /// Stops the reclaimer, ends every remaining process and deletes the
    /// swap file.
    pub fn shutdown(&self) -> Result<(), VmError> {
        if let Some(mut reclaimer) = self.reclaimer.lock().take() {
            reclaimer.stop();
        }
        let pids = self.processes.lock().pids();
        for pid in pids {
            warn!("process {pid} still running at shutdown");
            exit_process(&self.processes, pid, 0);
        }
        self.vm.terminate()?;
        info!("kernel stopped");
        Ok(())
    }
}

fn exit_process(processes: &SleepMutex<ProcessTable>, pid: Pid, status: i32) -> bool {
    let Some(process) = processes.lock().remove(pid, status) else {
        return false;
    };
    process.exit();
    info!("process {pid} exited with status {status}");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapping::page_replacement::RandomEviction;
    use crate::user_program::process::FAULT_EXIT_STATUS;
    use crate::vfs::{HostFs, TempFs};
    use std::thread;
    use vmkern_shared::mem::PAGE_FRAME_SIZE;
    use vmkern_shared::paging::VirtualAddress;

    const STACK_TOP: Vpn = 0x200;

    fn config(frames: usize) -> VmConfig {
        VmConfig {
            num_phys_pages: frames,
            low_water_mark: 0,
            background_reclaim: false,
            ..VmConfig::default()
        }
    }

    fn system(config: VmConfig) -> System {
        let vm = VirtualMemoryManager::with_policy(
            config,
            Box::new(TempFs::new()),
            Box::new(RandomEviction::seeded(11)),
        )
        .unwrap();
        System::with_manager(Arc::new(vm)).unwrap()
    }

    fn vaddr(vpn: Vpn) -> u32 {
        VirtualAddress::from_parts(vpn, 0).raw_value()
    }

    #[test]
    fn pids_count_up_from_one() {
        let system = system(config(4));
        let first = system.spawn(STACK_TOP).unwrap();
        let second = system.spawn(STACK_TOP).unwrap();
        assert_eq!((first.pid(), second.pid()), (1, 2));
        assert!(system.process(2).is_some());
        assert!(system.process(3).is_none());
        // Demand paging sets up swap with the first process.
        assert!(system.vm().swap_exists());
    }

    #[test]
    fn resident_mode_never_creates_swap() {
        let mut config = config(2);
        config.paging = PagingMode::Resident;
        config.background_reclaim = true;
        let system = system(config);
        let process = system.spawn(STACK_TOP).unwrap();
        process.allocate_stack().unwrap();
        system.handle_translation_fault(1, vaddr(STACK_TOP - 1)).unwrap();

        assert!(matches!(
            system.handle_translation_fault(1, vaddr(STACK_TOP - 2)),
            Err(FaultError::Kernel(VmError::OutOfMemory))
        ));
        assert!(!system.vm().swap_exists());
        // Out of memory is the kernel's problem, the process lives on.
        assert!(system.process(1).is_some());
        system.shutdown().unwrap();
    }

    #[test]
    fn fatal_fault_exits_the_process() {
        let system = system(config(4));
        let process = system.spawn(STACK_TOP).unwrap();
        let free = system.vm().free_frame_count();

        let err = system.handle_translation_fault(1, vaddr(0x10)).unwrap_err();
        assert!(matches!(err, FaultError::Segfault { pid: 1, vpn: 0x10 }));
        assert!(process.has_exited());
        assert!(system.process(1).is_none());
        assert_eq!(system.exit_status(1), Some(FAULT_EXIT_STATUS));
        assert_eq!(system.vm().free_frame_count(), free);

        // Other processes are unaffected.
        let other = system.spawn(STACK_TOP).unwrap();
        system.handle_translation_fault(other.pid(), vaddr(STACK_TOP)).unwrap();
        assert!(matches!(
            system.handle_translation_fault(1, vaddr(STACK_TOP)),
            Err(FaultError::Exited(1))
        ));
    }

    #[test]
    fn killed_process_frames_go_back_to_the_pool() {
        let system = system(config(4));
        let process = system.spawn(STACK_TOP).unwrap();
        process.load_section(0, &[3; 2 * PAGE_FRAME_SIZE], false).unwrap();
        assert_eq!(system.vm().free_frame_count(), 2);

        assert!(system.handle_translation_fault(1, vaddr(0x50)).is_err());
        assert_eq!(system.vm().free_frame_count(), 4);
        system.vm().check_consistency().unwrap();
    }

    #[test]
    fn exit_records_status_once() {
        let system = system(config(4));
        let process = system.spawn(STACK_TOP).unwrap();
        process.allocate_stack().unwrap();
        assert_eq!(system.vm().free_frame_count(), 3);

        assert!(system.exit(1, 7));
        assert!(!system.exit(1, 9));
        assert_eq!(system.exit_status(1), Some(7));
        assert_eq!(system.vm().free_frame_count(), 4);
        assert_eq!(system.exit_status(2), None);
    }

    #[test]
    fn processes_share_frames_through_swap() {
        let mut config = config(4);
        config.background_reclaim = true;
        config.low_water_mark = 1;
        let system = Arc::new(system(config));

        let workers: Vec<_> = (0..3u8)
            .map(|fill| {
                let process = system.spawn(STACK_TOP).unwrap();
                thread::spawn(move || {
                    let base = VirtualAddress::from_parts(STACK_TOP - 3, 0).raw_value();
                    let data = vec![fill + 1; 4 * PAGE_FRAME_SIZE];
                    for _ in 0..5 {
                        assert_eq!(process.write_virtual_memory(base, &data).unwrap(), data.len());
                        let mut back = vec![0; data.len()];
                        assert_eq!(process.read_virtual_memory(base, &mut back).unwrap(), back.len());
                        assert_eq!(back, data);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let vm = system.vm().clone();
        assert!(vm.eviction_count() > 0);
        assert_eq!(vm.pinned_frame_count(), 0);
        vm.check_consistency().unwrap();
        system.shutdown().unwrap();
        assert_eq!(vm.free_frame_count(), 4);
    }

    #[test]
    fn shutdown_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = VmConfig {
            swap_file: "boot.swp".into(),
            ..config(2)
        };
        let system = System::new(config, Box::new(HostFs::new(dir.path()))).unwrap();
        let process = system.spawn(STACK_TOP).unwrap();
        assert!(dir.path().join("boot.swp").exists());
        process.allocate_stack().unwrap();

        system.shutdown().unwrap();
        assert!(process.has_exited());
        assert_eq!(system.exit_status(1), Some(0));
        assert!(!dir.path().join("boot.swp").exists());
        assert_eq!(system.vm().free_frame_count(), 2);
    }

    #[test]
    fn bad_config_fails_boot() {
        let config = VmConfig {
            low_water_mark: 4,
            ..config(4)
        };
        assert!(matches!(
            System::new(config, Box::new(TempFs::new())),
            Err(BootError::Config(_))
        ));
    }
}
