use crate::config::ConfigError;
use crate::mem::{Ppn, Vpn};
use crate::threading::Pid;
use crate::vfs;
use thiserror::Error;

/// Failures of the virtual memory manager itself.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("out of physical memory: no free frame and nothing could be evicted")]
    OutOfMemory,
    #[error("eviction found no unpinned resident frame after {rounds} rounds")]
    EvictionStalled { rounds: usize },
    #[error("frame {0} does not exist")]
    InvalidFrame(Ppn),
    #[error("page {0:#x} is outside the virtual address space")]
    InvalidPage(Vpn),
    #[error("frame {ppn} already backs page {vpn:#x} of process {pid}")]
    FrameInUse { ppn: Ppn, pid: Pid, vpn: Vpn },
    #[error("frame {0} was not handed out by the frame allocator")]
    FrameNotAllocated(Ppn),
    #[error("swap: {0}")]
    Swap(#[from] SwapError),
    /// The page's own slot could not be read back. Frame shortages and
    /// failed evictions on the way to a free frame are reported as is.
    #[error("could not read page {vpn:#x} of process {pid} from swap: {source}")]
    SwapRead {
        pid: Pid,
        vpn: Vpn,
        source: SwapError,
    },
    #[error("page table corrupted: {0}")]
    Inconsistent(String),
    #[error("no process ids left")]
    PidsExhausted,
}

impl VmError {
    /// Conditions the kernel cannot recover from by killing one process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::EvictionStalled { .. } | Self::Inconsistent(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("short read at swap offset {offset}: got {read} bytes")]
    ShortRead { offset: u64, read: usize },
    #[error("short write at swap offset {offset}: wrote {written} bytes")]
    ShortWrite { offset: u64, written: usize },
    #[error("file system: {0}")]
    Fs(#[from] vfs::Error),
    #[error("swap file is closed")]
    Closed,
    #[error("no file system to hold the swap file")]
    NoFileSystem,
}

/// Outcome of a translation fault that could not be resolved.
#[derive(Debug, Error)]
pub enum FaultError {
    #[error("process {pid} accessed unmapped page {vpn:#x}")]
    Segfault { pid: Pid, vpn: Vpn },
    #[error("process {pid} could not page in {vpn:#x}: {source}")]
    PageIn {
        pid: Pid,
        vpn: Vpn,
        source: SwapError,
    },
    #[error(transparent)]
    Kernel(#[from] VmError),
    #[error("process {0} has exited")]
    Exited(Pid),
}

impl FaultError {
    /// Faults that terminate the faulting process but leave the kernel running.
    pub fn kills_process(&self) -> bool {
        matches!(self, Self::Segfault { .. } | Self::PageIn { .. })
    }
}

/// Failures while bringing the kernel up.
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start the reclaimer thread: {0}")]
    Reclaimer(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classes() {
        assert!(VmError::OutOfMemory.is_fatal());
        assert!(VmError::EvictionStalled { rounds: 3 }.is_fatal());
        assert!(!VmError::InvalidFrame(7).is_fatal());
        assert!(!VmError::Swap(SwapError::Closed).is_fatal());
        assert!(!VmError::SwapRead {
            pid: 1,
            vpn: 2,
            source: SwapError::Closed
        }
        .is_fatal());

        assert!(FaultError::Segfault { pid: 1, vpn: 2 }.kills_process());
        assert!(!FaultError::Kernel(VmError::OutOfMemory).kills_process());
    }

    #[test]
    fn messages_name_the_page() {
        let err = FaultError::Segfault { pid: 3, vpn: 0x40 };
        assert_eq!(err.to_string(), "process 3 accessed unmapped page 0x40");
        let err = VmError::from(SwapError::ShortRead { offset: 1024, read: 10 });
        assert_eq!(
            err.to_string(),
            "swap: short read at swap offset 1024: got 10 bytes"
        );
    }
}
