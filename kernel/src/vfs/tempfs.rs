use crate::vfs::{Error, FileHandle, FileSystem, Path, Result};
use core::cmp::min;
use log::trace;
use std::collections::BTreeMap;

type INodeNum = u64;

struct TempFile {
    data: Vec<u8>,
    /// still reachable by name
    linked: bool,
    open_handles: usize,
}

/// in-memory filesystem
#[derive(Default)]
pub struct TempFs {
    names: BTreeMap<String, INodeNum>,
    inodes: BTreeMap<INodeNum, TempFile>,
    handles: BTreeMap<u64, INodeNum>,
    next_inode: INodeNum,
    next_handle: u64,
}

impl TempFs {
    pub fn new() -> TempFs {
        TempFs::default()
    }

    fn file(&self, handle: FileHandle) -> Result<&TempFile> {
        let inode = self.handles.get(&handle.id).ok_or(Error::BadHandle)?;
        // Handles keep their inode alive, so this lookup cannot miss.
        self.inodes.get(inode).ok_or(Error::BadHandle)
    }

    fn file_mut(&mut self, handle: FileHandle) -> Result<&mut TempFile> {
        let inode = self.handles.get(&handle.id).ok_or(Error::BadHandle)?;
        self.inodes.get_mut(inode).ok_or(Error::BadHandle)
    }

    // Frees the inode once it is neither named nor open.
    fn maybe_release(&mut self, inode: INodeNum) {
        if self
            .inodes
            .get(&inode)
            .is_some_and(|f| !f.linked && f.open_handles == 0)
        {
            trace!("tempfs: freeing inode {inode}");
            self.inodes.remove(&inode);
        }
    }
}

impl FileSystem for TempFs {
    fn open(&mut self, name: &Path, create: bool) -> Result<FileHandle> {
        trace!("tempfs: open {name} (create: {create})");
        let inode = match self.names.get(name) {
            Some(&inode) => inode,
            None if create => {
                self.next_inode += 1;
                let inode = self.next_inode;
                self.inodes.insert(
                    inode,
                    TempFile {
                        data: Vec::new(),
                        linked: true,
                        open_handles: 0,
                    },
                );
                self.names.insert(name.into(), inode);
                inode
            }
            None => return Err(Error::NotFound),
        };
        let file = self.inodes.get_mut(&inode).ok_or(Error::NotFound)?;
        file.open_handles += 1;

        self.next_handle += 1;
        self.handles.insert(self.next_handle, inode);
        Ok(FileHandle {
            id: self.next_handle,
        })
    }

    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        trace!(
            "tempfs: read from {} @ offset {} length {}",
            file.id,
            offset,
            buf.len()
        );
        let f = self.file(file)?;
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= f.data.len() {
            // can't read any data
            return Ok(0);
        }
        let read_len = min(buf.len(), f.data.len() - offset);
        buf[..read_len].copy_from_slice(&f.data[offset..offset + read_len]);
        Ok(read_len)
    }

    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        trace!(
            "tempfs: write to {} @ offset {} length {}",
            file.id,
            offset,
            buf.len()
        );
        let f = self.file_mut(file)?;
        let end = usize::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_add(buf.len()))
            .filter(|&end| isize::try_from(end).is_ok())
            // file data would exceed isize::MAX bytes
            .ok_or(Error::NoSpace)?;
        let offset = end - buf.len();
        if end > f.data.len() {
            // return no space error if allocation failed
            f.data
                .try_reserve(end - f.data.len())
                .map_err(|_| Error::NoSpace)?;
            f.data.resize(end, 0);
        }
        f.data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self, file: FileHandle) -> Result<u64> {
        let f = self.file(file)?;
        u64::try_from(f.data.len()).map_err(|_| Error::NoSpace)
    }

    fn close(&mut self, file: FileHandle) -> Result<()> {
        trace!("tempfs: close {}", file.id);
        let inode = self.handles.remove(&file.id).ok_or(Error::BadHandle)?;
        if let Some(f) = self.inodes.get_mut(&inode) {
            f.open_handles -= 1;
        }
        self.maybe_release(inode);
        Ok(())
    }

    fn remove(&mut self, name: &Path) -> Result<()> {
        trace!("tempfs: remove {name}");
        let inode = self.names.remove(name).ok_or(Error::NotFound)?;
        // Note that open handles can still access the file until they are
        // closed.
        if let Some(f) = self.inodes.get_mut(&inode) {
            f.linked = false;
        }
        self.maybe_release(inode);
        Ok(())
    }
}
