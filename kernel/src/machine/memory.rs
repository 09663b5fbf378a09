use crate::error::VmError;
use crate::mem::Ppn;
use crate::sync::TicketMutex;
use core::cmp::min;
use vmkern_shared::mem::PAGE_FRAME_SIZE;

/// Main memory of the simulated machine, one lock per frame.
pub struct PhysicalMemory {
    frames: Box<[TicketMutex<Box<[u8]>>]>,
}

impl PhysicalMemory {
    pub fn new(num_frames: usize) -> Self {
        let frames = (0..num_frames)
            .map(|_| TicketMutex::new(vec![0; PAGE_FRAME_SIZE].into_boxed_slice()))
            .collect();
        Self { frames }
    }

    fn frame(&self, ppn: Ppn) -> Result<&TicketMutex<Box<[u8]>>, VmError> {
        self.frames.get(ppn).ok_or(VmError::InvalidFrame(ppn))
    }

    /// Copies from `offset` within the frame into `buf`, stopping at the end
    /// of the frame. Returns the number of bytes copied.
    pub fn read(&self, ppn: Ppn, offset: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        if offset >= PAGE_FRAME_SIZE {
            return Err(VmError::InvalidFrame(ppn));
        }
        let frame = self.frame(ppn)?.lock();
        let len = min(buf.len(), PAGE_FRAME_SIZE - offset);
        buf[..len].copy_from_slice(&frame[offset..offset + len]);
        Ok(len)
    }

    /// Copies `data` into the frame starting at `offset`, stopping at the end
    /// of the frame. Returns the number of bytes copied.
    pub fn write(&self, ppn: Ppn, offset: usize, data: &[u8]) -> Result<usize, VmError> {
        if offset >= PAGE_FRAME_SIZE {
            return Err(VmError::InvalidFrame(ppn));
        }
        let mut frame = self.frame(ppn)?.lock();
        let len = min(data.len(), PAGE_FRAME_SIZE - offset);
        frame[offset..offset + len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    /// The whole frame's contents.
    pub fn copy_out(&self, ppn: Ppn) -> Result<Vec<u8>, VmError> {
        Ok(self.frame(ppn)?.lock().to_vec())
    }

    /// Overwrites the start of the frame with `data` (at most one frame).
    pub fn copy_in(&self, ppn: Ppn, data: &[u8]) -> Result<(), VmError> {
        let mut frame = self.frame(ppn)?.lock();
        let len = min(data.len(), PAGE_FRAME_SIZE);
        frame[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    pub fn zero(&self, ppn: Ppn) -> Result<(), VmError> {
        self.frame(ppn)?.lock().fill(0);
        Ok(())
    }
}
