//! On-disk brick format.
//!
//! Layout, in file order:
//! 1. 256 × little-endian `i64`: voxel histogram at the time of the last
//!    flush (bin per first-byte value).
//! 2. zlib-deflate stream of the raw `w·h·d·n_cmp` payload.
//!
//! Handles are leased from the shared [`FileCache`] for the duration of a
//! [`BrickFile`]; dropping the value releases the lease.

use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::codec;
use crate::error::{Error, Result};
use crate::vfs::{FileCache, FileHandle, OpenOptions};
use crate::voxel::brick::{Brick, Histogram};

/// Size of the histogram header in bytes
pub const HEADER_BYTES: usize = 256 * 8;

/// A brick file opened through the file cache
pub struct BrickFile {
    path: PathBuf,
    handle: FileHandle,
}

impl BrickFile {
    /// Open (or create) a brick file, leasing its handle from the cache
    pub fn open(files: &mut FileCache, path: &Path) -> Result<Self> {
        let handle = files.open(path, OpenOptions::read_write_create())?;
        Ok(Self {
            path: path.to_path_buf(),
            handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.handle.borrow_mut().file.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn rewind(&self) -> Result<()> {
        self.handle.borrow_mut().file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        Ok(self.handle.borrow_mut().file.seek(pos)?)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut f = self.handle.borrow_mut();
        f.file.set_len(size)?;
        f.mark_dirty();
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<()> {
        self.handle.borrow_mut().file.read_exact(buf)?;
        Ok(())
    }

    pub fn write(&self, buf: &[u8]) -> Result<()> {
        let mut f = self.handle.borrow_mut();
        f.file.write_all(buf)?;
        f.mark_dirty();
        Ok(())
    }

    /// Read header and payload into `brick` and `hist`.
    ///
    /// The inflated payload must match the brick size exactly; anything else
    /// means the archive is damaged.
    pub fn read_brick(&self, brick: &mut Brick, hist: &mut Histogram) -> Result<()> {
        let mut f = self.handle.borrow_mut();
        f.file.seek(SeekFrom::Start(0))?;
        for bin in hist.iter_mut() {
            *bin = codec::read_i64(&mut f.file)?;
        }

        let mut compressed = Vec::new();
        f.file.read_to_end(&mut compressed)?;

        let mut payload = Vec::new();
        payload.try_reserve_exact(brick.data().len())?;
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut payload)?;
        if payload.len() != brick.data().len() {
            return Err(Error::CorruptedArchive(format!(
                "{}: payload is {} bytes, brick wants {}",
                self.path.display(),
                payload.len(),
                brick.data().len()
            )));
        }
        brick.data_mut().copy_from_slice(&payload);
        Ok(())
    }

    /// Compress and write `brick` behind a fresh histogram header.
    ///
    /// The file is truncated first so a smaller payload cannot leave stale
    /// tail bytes from the previous version.
    pub fn write_brick(&self, brick: &Brick, hist: &Histogram) -> Result<()> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(brick.data())?;
        let compressed = encoder.finish()?;

        let mut f = self.handle.borrow_mut();
        f.file.seek(SeekFrom::Start(0))?;
        f.file.set_len(0)?;
        for bin in hist.iter() {
            codec::write_i64(&mut f.file, *bin)?;
        }
        f.file.write_all(&compressed)?;
        f.mark_dirty();
        Ok(())
    }
}
