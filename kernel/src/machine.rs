//! The simulated processor the kernel runs on: physical memory and the
//! translation lookaside buffer.

pub mod memory;
pub mod tlb;

pub use memory::PhysicalMemory;
pub use tlb::Tlb;
