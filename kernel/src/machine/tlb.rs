use crate::mem::{TranslationEntry, Vpn};
use crate::sync::TicketMutex;
use log::trace;
use rand::Rng;

/// A small, fully associative translation cache.
pub struct Tlb {
    slots: TicketMutex<Box<[TranslationEntry]>>,
}

impl Tlb {
    pub fn new(size: usize) -> Self {
        Self {
            slots: TicketMutex::new(vec![TranslationEntry::INVALID; size].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_entry(&self, index: usize) -> Option<TranslationEntry> {
        self.slots.lock().get(index).copied()
    }

    /// Replaces slot `index`, returning what it held before.
    pub fn write_entry(&self, index: usize, entry: TranslationEntry) -> Option<TranslationEntry> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index)?;
        Some(core::mem::replace(slot, entry))
    }

    /// The cached translation for `vpn`, if a valid slot holds one.
    pub fn lookup(&self, vpn: Vpn) -> Option<TranslationEntry> {
        self.slots
            .lock()
            .iter()
            .find(|entry| entry.valid() && entry.vpn == vpn)
            .copied()
    }

    /// Caches `entry` with its `used` bit cleared. A slot already caching
    /// the same page is reused first, then an empty slot, then a random one.
    /// Returns the slot index.
    pub fn install(&self, entry: TranslationEntry) -> usize {
        let mut entry = entry;
        entry.flags = entry.flags.with_used(false);

        let mut slots = self.slots.lock();
        if slots.is_empty() {
            return 0;
        }
        let index = slots
            .iter()
            .position(|slot| slot.valid() && slot.vpn == entry.vpn)
            .or_else(|| slots.iter().position(|slot| !slot.valid()))
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..slots.len()));
        trace!("tlb: vpn {:#x} -> ppn {} in slot {index}", entry.vpn, entry.ppn);
        slots[index] = entry;
        index
    }

    /// Drops any cached translation for `vpn`. Returns whether one was cached.
    pub fn invalidate(&self, vpn: Vpn) -> bool {
        let mut found = false;
        for slot in self.slots.lock().iter_mut() {
            if slot.valid() && slot.vpn == vpn {
                slot.flags = slot.flags.with_valid(false);
                found = true;
            }
        }
        found
    }

    pub fn invalidate_all(&self) {
        for slot in self.slots.lock().iter_mut() {
            slot.flags = slot.flags.with_valid(false);
        }
    }

    /// Sets the `used` bit (and `dirty` for writes) of a cached translation.
    /// Writes to a read-only page leave the slot untouched.
    pub fn mark_accessed(&self, vpn: Vpn, write: bool) -> Option<TranslationEntry> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|slot| slot.valid() && slot.vpn == vpn)?;
        if !(write && slot.read_only()) {
            slot.touch(write);
        }
        Some(*slot)
    }
}
