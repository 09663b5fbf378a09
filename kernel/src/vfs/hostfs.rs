//! Files kept in a directory of the host machine.

use crate::vfs::{Error, FileHandle, FileSystem, Path, Result};
use log::trace;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

pub struct HostFs {
    root: PathBuf,
    open_files: BTreeMap<u64, File>,
    next_handle: u64,
}

impl HostFs {
    /// Serves the files directly inside `root`, which must exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open_files: BTreeMap::new(),
            next_handle: 0,
        }
    }

    fn host_path(&self, name: &Path) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Io(ErrorKind::InvalidInput));
        }
        Ok(self.root.join(name))
    }

    fn file(&self, handle: FileHandle) -> Result<&File> {
        self.open_files.get(&handle.id).ok_or(Error::BadHandle)
    }
}

impl FileSystem for HostFs {
    fn open(&mut self, name: &Path, create: bool) -> Result<FileHandle> {
        let path = self.host_path(name)?;
        trace!("hostfs: open {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        self.next_handle += 1;
        self.open_files.insert(self.next_handle, file);
        Ok(FileHandle {
            id: self.next_handle,
        })
    }

    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut f = self.file(file)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match f.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut f = self.file(file)?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buf).map_err(|err| match err.kind() {
            ErrorKind::WriteZero => Error::NoSpace,
            _ => err.into(),
        })?;
        Ok(buf.len())
    }

    fn len(&self, file: FileHandle) -> Result<u64> {
        Ok(self.file(file)?.metadata()?.len())
    }

    fn close(&mut self, file: FileHandle) -> Result<()> {
        self.open_files
            .remove(&file.id)
            .map(drop)
            .ok_or(Error::BadHandle)
    }

    fn remove(&mut self, name: &Path) -> Result<()> {
        let path = self.host_path(name)?;
        trace!("hostfs: remove {}", path.display());
        fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_behaviour() {
        let dir = tempfile::tempdir().unwrap();
        crate::vfs::tests::exercise(&mut HostFs::new(dir.path()));
    }

    #[test]
    fn files_land_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = HostFs::new(dir.path());
        let file = fs.open("vm.swp", true).unwrap();
        fs.write(file, 0, &[7; 16]).unwrap();
        fs.close(file).unwrap();
        assert_eq!(std::fs::read(dir.path().join("vm.swp")).unwrap(), [7; 16]);
    }

    #[test]
    fn rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = HostFs::new(dir.path());
        assert_eq!(
            fs.open("../escape", true),
            Err(Error::Io(ErrorKind::InvalidInput))
        );
        assert_eq!(fs.open("", true), Err(Error::Io(ErrorKind::InvalidInput)));
    }
}
