// Address layout of the simulated 32-bit processor: a 22-bit virtual page
// number followed by a 10-bit page offset.

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u22};
use bitbybit::bitfield;

pub const PAGE_SHIFT: u32 = 10;

const OFFSET_MASK: u32 = (1 << PAGE_SHIFT) - 1;

const _: () = assert!(PAGE_FRAME_SIZE == 1 << PAGE_SHIFT);

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(10..=31, r)]
    page_number: u22,
    #[bits(0..=9, r)]
    offset: u10,
}

impl VirtualAddress {
    pub fn from_parts(vpn: u32, offset: u16) -> Self {
        let offset = u32::from(offset) & OFFSET_MASK;
        Self::new_with_raw_value((vpn << PAGE_SHIFT) | offset)
    }

    /// Virtual page number as a plain integer.
    pub fn vpn(&self) -> u32 {
        self.page_number().value()
    }

    /// Offset into the page as a plain integer.
    pub fn page_offset(&self) -> usize {
        usize::from(self.offset().value())
    }
}

/// Status bits of a translation, as cached by the TLB.
#[bitfield(u8, default = 0)]
pub struct PageFlags {
    #[bit(0, rw)]
    valid: bool,
    #[bit(1, rw)]
    read_only: bool,
    #[bit(2, rw)]
    used: bool,
    #[bit(3, rw)]
    dirty: bool,
}
