//! The inverted page table and the core map.
//!
//! The forward table answers "where is page `vpn` of process `pid`", the core
//! map answers "who owns frame `ppn`". Both live behind one lock and are only
//! changed together, through a [`TableGuard`].

use super::{Ppn, TranslationEntry, Vpn, MAX_VPN};
use crate::error::VmError;
use crate::sync::{SleepMutex, SleepMutexGuard};
use crate::threading::Pid;
use core::ops::{Deref, DerefMut};
use log::{trace, warn};
use std::collections::BTreeMap;

/// Owner of a resident frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreMapEntry {
    pub pid: Pid,
    pub vpn: Vpn,
}

pub struct PageTables {
    forward: BTreeMap<Pid, BTreeMap<Vpn, TranslationEntry>>,
    core_map: Box<[Option<CoreMapEntry>]>,
}

impl PageTables {
    pub fn new(num_frames: usize) -> Self {
        Self {
            forward: BTreeMap::new(),
            core_map: vec![None; num_frames].into_boxed_slice(),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.core_map.len()
    }

    /// Maps `entry.vpn` of `pid` to `entry.ppn`, replacing any previous
    /// mapping of that page, and returns the replaced entry. An entry that is
    /// not valid removes the mapping instead.
    ///
    /// Rejected requests leave both tables untouched.
    pub fn put(
        &mut self,
        pid: Pid,
        entry: TranslationEntry,
    ) -> Result<Option<TranslationEntry>, VmError> {
        if !entry.valid() {
            return Ok(self.remove(pid, entry.vpn));
        }
        if entry.vpn > MAX_VPN {
            warn!("rejecting mapping of page {:#x} for process {pid}", entry.vpn);
            return Err(VmError::InvalidPage(entry.vpn));
        }
        let Some(slot) = self.core_map.get(entry.ppn) else {
            warn!("rejecting mapping to frame {} for process {pid}", entry.ppn);
            return Err(VmError::InvalidFrame(entry.ppn));
        };
        if let Some(owner) = *slot {
            if owner != (CoreMapEntry { pid, vpn: entry.vpn }) {
                warn!(
                    "frame {} already backs page {:#x} of process {}",
                    entry.ppn, owner.vpn, owner.pid
                );
                return Err(VmError::FrameInUse {
                    ppn: entry.ppn,
                    pid: owner.pid,
                    vpn: owner.vpn,
                });
            }
        }

        trace!("map {pid}:{:#x} -> {}", entry.vpn, entry.ppn);
        let previous = self.forward.entry(pid).or_default().insert(entry.vpn, entry);
        if let Some(previous) = previous {
            if previous.ppn != entry.ppn {
                self.core_map[previous.ppn] = None;
            }
        }
        self.core_map[entry.ppn] = Some(CoreMapEntry {
            pid,
            vpn: entry.vpn,
        });
        Ok(previous)
    }

    pub fn get(&self, pid: Pid, vpn: Vpn) -> Option<TranslationEntry> {
        self.forward.get(&pid)?.get(&vpn).copied()
    }

    /// Every resident page of `pid`, in page order.
    pub fn get_all(&self, pid: Pid) -> Vec<TranslationEntry> {
        self.forward
            .get(&pid)
            .map(|pages| pages.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, pid: Pid, vpn: Vpn) -> Option<TranslationEntry> {
        let pages = self.forward.get_mut(&pid)?;
        let entry = pages.remove(&vpn)?;
        if pages.is_empty() {
            self.forward.remove(&pid);
        }
        self.core_map[entry.ppn] = None;
        trace!("unmap {pid}:{vpn:#x} from {}", entry.ppn);
        Some(entry)
    }

    /// Drops every mapping of `pid` and returns them.
    pub fn remove_all(&mut self, pid: Pid) -> Vec<TranslationEntry> {
        let Some(pages) = self.forward.remove(&pid) else {
            return Vec::new();
        };
        for entry in pages.values() {
            self.core_map[entry.ppn] = None;
        }
        pages.into_values().collect()
    }

    /// Core map lookup.
    pub fn owner(&self, ppn: Ppn) -> Option<CoreMapEntry> {
        self.core_map.get(ppn).copied().flatten()
    }

    /// Frames currently backing a translation.
    pub fn mapped_frames(&self) -> impl Iterator<Item = Ppn> + '_ {
        self.core_map
            .iter()
            .enumerate()
            .filter_map(|(ppn, slot)| slot.map(|_| ppn))
    }

    pub fn resident_count(&self) -> usize {
        self.core_map.iter().filter(|slot| slot.is_some()).count()
    }

    /// Records an access to a resident page.
    pub fn mark_accessed(&mut self, pid: Pid, vpn: Vpn, write: bool) -> Option<TranslationEntry> {
        let entry = self.forward.get_mut(&pid)?.get_mut(&vpn)?;
        entry.touch(write && !entry.read_only());
        Some(*entry)
    }

    /// Checks that the forward table and the core map describe the same
    /// mappings.
    pub fn check_consistency(&self) -> Result<(), VmError> {
        let mut forward_count = 0;
        for (&pid, pages) in &self.forward {
            for (&vpn, entry) in pages {
                forward_count += 1;
                if entry.vpn != vpn || !entry.valid() {
                    return Err(VmError::Inconsistent(format!(
                        "entry for {pid}:{vpn:#x} is {entry:?}"
                    )));
                }
                if self.owner(entry.ppn) != Some(CoreMapEntry { pid, vpn }) {
                    return Err(VmError::Inconsistent(format!(
                        "{pid}:{vpn:#x} maps frame {} owned by {:?}",
                        entry.ppn,
                        self.owner(entry.ppn)
                    )));
                }
            }
        }
        for ppn in self.mapped_frames() {
            let Some(owner) = self.owner(ppn) else {
                continue;
            };
            if self.get(owner.pid, owner.vpn).map(|entry| entry.ppn) != Some(ppn) {
                return Err(VmError::Inconsistent(format!(
                    "frame {ppn} claims {}:{:#x}, which is not mapped there",
                    owner.pid, owner.vpn
                )));
            }
        }
        if forward_count != self.resident_count() {
            return Err(VmError::Inconsistent(format!(
                "{forward_count} mappings but {} frames in use",
                self.resident_count()
            )));
        }
        Ok(())
    }
}

/// Proof that the page table lock is held. Functions that need the tables
/// locked take `&mut TableGuard` instead of locking themselves.
pub struct TableGuard<'a> {
    tables: SleepMutexGuard<'a, PageTables>,
}

impl<'a> TableGuard<'a> {
    pub fn lock(tables: &'a SleepMutex<PageTables>) -> Self {
        Self {
            tables: tables.lock(),
        }
    }
}

impl Deref for TableGuard<'_> {
    type Target = PageTables;

    fn deref(&self) -> &PageTables {
        &self.tables
    }
}

impl DerefMut for TableGuard<'_> {
    fn deref_mut(&mut self) -> &mut PageTables {
        &mut self.tables
    }
}
