//! Filesystem abstraction.
//!
//! The store never touches `std::fs` directly: the host hands it a
//! [`FileSystem`] implementation and (separately) a mkdir callback, so voxel
//! data can live on a plain directory tree, inside an archive, or on a mock
//! used by tests. All open handles are pooled in the shared [`FileCache`].

pub mod file_cache;

pub use file_cache::{FileCache, FileHandle};

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::Path;

/// Open flags, mirroring the subset of `std::fs::OpenOptions` the store uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
}

impl OpenOptions {
    /// Read-only access to an existing file
    pub fn read() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
        }
    }

    /// Read/write access, creating the file when missing
    pub fn read_write_create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
        }
    }

    /// Write access, creating the file when missing
    pub fn write_create() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
        }
    }
}

/// One open file: positioned byte io plus length control.
pub trait VfsFile: Read + Write + Seek {
    /// Current file length in bytes
    fn len(&mut self) -> io::Result<u64>;

    /// Truncate or extend to `size` bytes
    fn set_len(&mut self, size: u64) -> io::Result<()>;
}

/// A mountable file system
pub trait FileSystem {
    fn open(&self, path: &Path, opts: OpenOptions) -> io::Result<Box<dyn VfsFile>>;

    /// Remove a file; missing files are not an error
    fn remove(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

/// [`FileSystem`] backed by the host file system
#[derive(Debug, Default)]
pub struct StdFileSystem;

struct StdFile(fs::File);

impl Read for StdFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for StdFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Seek for StdFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl VfsFile for StdFile {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }

    fn set_len(&mut self, size: u64) -> io::Result<()> {
        self.0.set_len(size)
    }
}

impl FileSystem for StdFileSystem {
    fn open(&self, path: &Path, opts: OpenOptions) -> io::Result<Box<dyn VfsFile>> {
        let file = fs::OpenOptions::new()
            .read(opts.read)
            .write(opts.write)
            .create(opts.create)
            .open(path)?;
        Ok(Box::new(StdFile(file)))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn test_std_fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let fs = StdFileSystem;

        let mut f = fs.open(&path, OpenOptions::read_write_create()).unwrap();
        f.write_all(b"hello world").unwrap();
        assert_eq!(f.len().unwrap(), 11);

        f.set_len(5).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");

        fs.remove(&path).unwrap();
        assert!(!fs.exists(&path));
        // removing a missing file is fine
        fs.remove(&path).unwrap();
    }
}
