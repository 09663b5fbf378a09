//! Process and thread identity. Every host thread that touches the kernel
//! is given a thread id the first time it asks for one.

pub mod process_table;

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

pub type Pid = u16;
pub type Tid = u32;
pub type AtomicPid = AtomicU16;
pub type AtomicTid = AtomicU32;

/// Owner recorded for work done by the kernel itself, such as background
/// reclamation. Never handed to a user process.
pub const KERNEL_PID: Pid = 0;

// Zero is reserved to mean "no thread".
static NEXT_TID: AtomicTid = AtomicTid::new(1);

thread_local! {
    static CURRENT_TID: Tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

pub fn current_tid() -> Tid {
    CURRENT_TID.with(|tid| *tid)
}
