use super::{Ppn, Vpn};
use core::fmt;
use vmkern_shared::paging::PageFlags;

/// The live mapping of one virtual page to a physical frame.
///
/// The owning process is implied by where the entry is stored: the page
/// table keys entries by process, and each process has its own TLB.
#[derive(Clone, Copy)]
pub struct TranslationEntry {
    pub vpn: Vpn,
    pub ppn: Ppn,
    pub flags: PageFlags,
}

impl TranslationEntry {
    pub const INVALID: Self = Self {
        vpn: 0,
        ppn: 0,
        flags: PageFlags::DEFAULT,
    };

    /// A freshly resident page: valid, not yet used, clean.
    pub fn new(vpn: Vpn, ppn: Ppn, read_only: bool) -> Self {
        Self {
            vpn,
            ppn,
            flags: PageFlags::DEFAULT
                .with_valid(true)
                .with_read_only(read_only),
        }
    }

    pub fn valid(&self) -> bool {
        self.flags.valid()
    }

    pub fn read_only(&self) -> bool {
        self.flags.read_only()
    }

    pub fn used(&self) -> bool {
        self.flags.used()
    }

    pub fn dirty(&self) -> bool {
        self.flags.dirty()
    }

    /// Records an access; writes also mark the page dirty.
    pub fn touch(&mut self, write: bool) {
        self.flags = self.flags.with_used(true);
        if write {
            self.flags = self.flags.with_dirty(true);
        }
    }
}

impl PartialEq for TranslationEntry {
    fn eq(&self, other: &Self) -> bool {
        self.vpn == other.vpn
            && self.ppn == other.ppn
            && self.flags.raw_value() == other.flags.raw_value()
    }
}

impl Eq for TranslationEntry {}

impl fmt::Debug for TranslationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationEntry")
            .field("vpn", &self.vpn)
            .field("ppn", &self.ppn)
            .field("valid", &self.valid())
            .field("read_only", &self.read_only())
            .field("used", &self.used())
            .field("dirty", &self.dirty())
            .finish()
    }
}
