//! A demand-paged virtual memory subsystem for a small teaching kernel,
//! running on simulated hardware.
//!
//! Physical frames are shared by every process through one inverted page
//! table. When the frame pool runs dry a resident page is written to a swap
//! file and its frame reused; the owning process faults it back in later.
//! [`system::System`] wires the pieces together at boot.

pub mod config;
pub mod error;
pub mod machine;
pub mod mem;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod threading;
pub mod user_program;
pub mod vfs;
