//! The swap file and the eviction machinery that feeds it.
//!
//! The swap file is a headerless run of page-sized slots. A page gets a slot
//! at the end of the file the first time it is written out and keeps it for
//! the lifetime of the kernel; slots are never reused for other pages. Which
//! slot belongs to which page is only known in memory, so the file is
//! deleted at shutdown.

pub mod page_replacement;
pub mod reclaimer;

use crate::error::{SwapError, VmError};
use crate::machine::PhysicalMemory;
use crate::mem::{Ppn, TranslationEntry, Vpn};
use crate::sync::SleepMutex;
use crate::threading::Pid;
use crate::vfs::{self, FileHandle, FileSystem};
use log::{debug, info, trace};
use std::collections::BTreeMap;
use vmkern_shared::mem::PAGE_FRAME_SIZE;

// Lossless: a frame is 1 KiB.
const SLOT_SIZE: u64 = PAGE_FRAME_SIZE as u64;

/// Where a swapped-out page lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEntry {
    /// Byte offset of the slot in the swap file.
    pub offset: u64,
    pub read_only: bool,
}

struct SwapState {
    fs: Box<dyn FileSystem>,
    file: Option<FileHandle>,
    slots: BTreeMap<(Pid, Vpn), SwapEntry>,
    end: u64,
}

pub struct SwapStore {
    name: String,
    state: SleepMutex<SwapState>,
}

impl SwapStore {
    /// Creates an empty swap file called `name`, deleting any file already
    /// there.
    pub fn create(fs: &mut dyn FileSystem, name: &str) -> Result<FileHandle, SwapError> {
        match fs.remove(name) {
            Ok(()) => info!("removed stale swap file {name}"),
            Err(vfs::Error::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        let file = fs.open(name, true)?;
        info!("created swap file {name}");
        Ok(file)
    }

    /// Takes over `file`, which [`SwapStore::create`] made on `fs`.
    pub fn new(fs: Box<dyn FileSystem>, file: FileHandle, name: &str) -> Self {
        Self {
            name: name.into(),
            state: SleepMutex::new(SwapState {
                fs,
                file: Some(file),
                slots: BTreeMap::new(),
                end: 0,
            }),
        }
    }

    /// Writes the frame behind `entry` out as page `entry.vpn` of `pid`.
    ///
    /// The page keeps its slot if it was written before, otherwise it is
    /// appended. A failed write does not claim a slot.
    pub fn write_page(
        &self,
        memory: &PhysicalMemory,
        pid: Pid,
        entry: &TranslationEntry,
    ) -> Result<(), VmError> {
        let mut state = self.state.lock();
        let file = state.file.ok_or(SwapError::Closed)?;
        let key = (pid, entry.vpn);
        let offset = state.slots.get(&key).map_or(state.end, |slot| slot.offset);

        let data = memory.copy_out(entry.ppn)?;
        let written = state
            .fs
            .write(file, offset, &data)
            .map_err(SwapError::from)?;
        if written != data.len() {
            return Err(SwapError::ShortWrite { offset, written }.into());
        }

        let slot = SwapEntry {
            offset,
            read_only: entry.read_only(),
        };
        if state.slots.insert(key, slot).is_none() {
            state.end += SLOT_SIZE;
        }
        trace!(
            "swap out {pid}:{:#x} from frame {} to offset {offset}",
            entry.vpn,
            entry.ppn
        );
        Ok(())
    }

    /// Reads page `vpn` of `pid` into frame `ppn`.
    ///
    /// Returns `None` if the page was never written out. Otherwise the result
    /// is a fresh, valid translation carrying the page's read-only flag.
    pub fn load_page(
        &self,
        memory: &PhysicalMemory,
        pid: Pid,
        vpn: Vpn,
        ppn: Ppn,
    ) -> Result<Option<TranslationEntry>, VmError> {
        let state = self.state.lock();
        let Some(slot) = state.slots.get(&(pid, vpn)).copied() else {
            return Ok(None);
        };
        let file = state.file.ok_or(SwapError::Closed)?;

        let mut data = vec![0; PAGE_FRAME_SIZE];
        let read = state
            .fs
            .read(file, slot.offset, &mut data)
            .map_err(SwapError::from)?;
        if read != data.len() {
            return Err(SwapError::ShortRead {
                offset: slot.offset,
                read,
            }
            .into());
        }
        memory.copy_in(ppn, &data)?;
        debug!("swap in {pid}:{vpn:#x} from offset {} to frame {ppn}", slot.offset);
        Ok(Some(TranslationEntry::new(vpn, ppn, slot.read_only)))
    }

    /// False once the store has been terminated.
    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    pub fn contains(&self, pid: Pid, vpn: Vpn) -> bool {
        self.state.lock().slots.contains_key(&(pid, vpn))
    }

    pub fn slot(&self, pid: Pid, vpn: Vpn) -> Option<SwapEntry> {
        self.state.lock().slots.get(&(pid, vpn)).copied()
    }

    /// Slots handed out so far.
    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Closes and deletes the swap file. Later reads and writes fail with
    /// [`SwapError::Closed`].
    pub fn terminate(&self) -> Result<(), SwapError> {
        let mut state = self.state.lock();
        let Some(file) = state.file.take() else {
            return Ok(());
        };
        state.fs.close(file)?;
        state.fs.remove(&self.name)?;
        info!("deleted swap file {}", self.name);
        Ok(())
    }
}
