//! Physical frames, the global translation tables, and the virtual memory
//! manager built on them.

pub mod frame_allocator;
pub mod manager;
pub mod page_table;
pub mod pin;
pub mod translation;

pub use frame_allocator::{DemandPaging, FramePool, FrameSource, ResidentOnly};
pub use manager::VirtualMemoryManager;
pub use page_table::{CoreMapEntry, PageTables, TableGuard};
pub use pin::{PinSet, PinnedFrame, PinnedTranslation};
pub use translation::TranslationEntry;

use vmkern_shared::paging::PAGE_SHIFT;

/// Virtual page number.
pub type Vpn = u32;
/// Physical page (frame) number.
pub type Ppn = usize;

/// Highest page number a 32-bit virtual address can name.
pub const MAX_VPN: Vpn = u32::MAX >> PAGE_SHIFT;
