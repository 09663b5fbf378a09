use crate::sizes::KB;

// Page size is 1KB. This is a property of the simulated MIPS processor.
pub const PAGE_FRAME_SIZE: usize = KB;
