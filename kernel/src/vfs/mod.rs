pub mod hostfs;
pub mod tempfs;

pub use hostfs::HostFs;
pub use tempfs::TempFs;

use thiserror::Error;

pub type Path = str;

/// Represents an open file
///
/// **IMPORTANT**: the kernel must call [`FileSystem::close`] when it is done
/// with a handle. A removed file keeps its data until its last handle is
/// closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileHandle {
    /// identifies the open file within its filesystem
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// file not found
    #[error("not found")]
    NotFound,
    /// no space left on device
    #[error("no space left on device")]
    NoSpace,
    /// handle is not open on this filesystem
    #[error("bad file handle")]
    BadHandle,
    /// the host file system reported an error
    #[error("host I/O error: {0}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            kind => Self::Io(kind),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// A flat file system: names are looked up directly, there are no
/// directories.
pub trait FileSystem: Send {
    /// Open a file, creating an empty one first if `create` is set and it
    /// does not exist yet. Existing contents are never truncated.
    fn open(&mut self, name: &Path, create: bool) -> Result<FileHandle>;
    /// Read from file into buf at offset.
    ///
    /// Returns the number of bytes read, which is short at end of file.
    fn read(&self, file: FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write to file from buf at offset, growing the file as needed.
    fn write(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Current size of the file in bytes.
    fn len(&self, file: FileHandle) -> Result<u64>;
    /// Release a handle. The kernel must not use it afterwards.
    fn close(&mut self, file: FileHandle) -> Result<()>;
    /// Remove a file by name.
    fn remove(&mut self, name: &Path) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // Behaviour every implementation has to share.
    pub(crate) fn exercise<F: FileSystem>(fs: &mut F) {
        assert_eq!(fs.open("missing", false), Err(Error::NotFound));

        let file = fs.open("data", true).unwrap();
        assert_eq!(fs.len(file).unwrap(), 0);
        assert_eq!(fs.write(file, 0, b"hello").unwrap(), 5);
        // writing past the end leaves a zero-filled hole
        assert_eq!(fs.write(file, 8, b"!").unwrap(), 1);
        assert_eq!(fs.len(file).unwrap(), 9);

        let mut buf = [0xFF; 12];
        assert_eq!(fs.read(file, 0, &mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"hello\0\0\0!");
        assert_eq!(fs.read(file, 100, &mut buf).unwrap(), 0);

        // reopening neither truncates nor loses data
        let again = fs.open("data", true).unwrap();
        let mut buf = [0; 5];
        assert_eq!(fs.read(again, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        fs.close(again).unwrap();

        fs.close(file).unwrap();
        assert_eq!(fs.close(file), Err(Error::BadHandle));

        fs.remove("data").unwrap();
        assert_eq!(fs.remove("data"), Err(Error::NotFound));
        assert_eq!(fs.open("data", false), Err(Error::NotFound));
    }
}
