//! LRU cache for open file handles
//!
//! Octrees can reference thousands of brick files; the process cannot keep
//! them all open. The cache pools handles under a configurable bound shared
//! by every octree of a world. A handle stays usable while a caller holds a
//! clone of its `Rc`; eviction only considers handles nobody holds.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::Result;
use crate::vfs::{FileSystem, OpenOptions, VfsFile};

/// An open file pooled by the cache.
///
/// `dirty` is set by writers and cleared when the contents are flushed; an
/// entry is never closed dirty.
pub struct CachedFile {
    pub file: Box<dyn VfsFile>,
    path: PathBuf,
    dirty: bool,
}

impl CachedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the contents as ahead of the medium
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.dirty {
            self.file.flush()?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Shared lease on a cached file. Holding a clone pins the handle open.
pub type FileHandle = Rc<RefCell<CachedFile>>;

/// Bounded LRU of open file handles, shared across all octrees of a world
pub struct FileCache {
    vfs: Rc<dyn FileSystem>,
    entries: HashMap<PathBuf, FileHandle>,
    /// Access order: oldest first, newest last
    order: Vec<PathBuf>,
    max_open: usize,
}

impl FileCache {
    pub fn new(vfs: Rc<dyn FileSystem>, max_open: usize) -> Self {
        Self {
            vfs,
            entries: HashMap::new(),
            order: Vec::new(),
            max_open,
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    /// Open a file through the cache, reusing the pooled handle when present.
    ///
    /// The returned lease must be dropped when the read/write/seek burst is
    /// over, otherwise the handle can never be evicted.
    pub fn open(&mut self, path: &Path, opts: OpenOptions) -> Result<FileHandle> {
        if let Some(handle) = self.entries.get(path) {
            let handle = Rc::clone(handle);
            self.touch(path);
            return Ok(handle);
        }

        let file = self.vfs.open(path, opts)?;
        let handle = Rc::new(RefCell::new(CachedFile {
            file,
            path: path.to_path_buf(),
            dirty: false,
        }));
        self.entries.insert(path.to_path_buf(), Rc::clone(&handle));
        self.order.push(path.to_path_buf());
        Ok(handle)
    }

    /// Enforce the bound: close released handles, least recently used first.
    /// Dirty entries are flushed before they are dropped.
    pub fn update(&mut self) -> Result<()> {
        while self.entries.len() > self.max_open {
            let candidate = self
                .order
                .iter()
                .position(|p| self.entries.get(p).is_some_and(|h| Rc::strong_count(h) == 1));
            let Some(pos) = candidate else {
                // every surplus handle is leased, nothing to do
                break;
            };
            let path = self.order.remove(pos);
            if let Some(handle) = self.entries.remove(&path) {
                handle.borrow_mut().flush()?;
                log::trace!("file cache: closed {}", path.display());
            }
        }
        Ok(())
    }

    /// Flush every dirty entry without closing anything
    pub fn sync(&mut self) -> Result<()> {
        for handle in self.entries.values() {
            handle.borrow_mut().flush()?;
        }
        Ok(())
    }

    /// Forget the handle for `path` (if any) and delete the file
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        if self.entries.remove(path).is_some() {
            self.order.retain(|p| p != path);
        }
        self.vfs.remove(path)?;
        Ok(())
    }

    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.order.iter().position(|p| p == path) {
            let p = self.order.remove(pos);
            self.order.push(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::StdFileSystem;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn cache_in(dir: &Path, max_open: usize) -> (FileCache, PathBuf) {
        let vfs: Rc<dyn FileSystem> = Rc::new(StdFileSystem);
        (FileCache::new(vfs, max_open), dir.to_path_buf())
    }

    #[test]
    fn test_open_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cache, base) = cache_in(dir.path(), 4);

        let a = cache.open(&base.join("a"), OpenOptions::read_write_create()).unwrap();
        let b = cache.open(&base.join("a"), OpenOptions::read_write_create()).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.open_count(), 1);
    }

    #[test]
    fn test_update_enforces_bound_lru_first() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cache, base) = cache_in(dir.path(), 2);

        for name in ["a", "b", "c", "d"] {
            cache.open(&base.join(name), OpenOptions::read_write_create()).unwrap();
        }
        assert_eq!(cache.open_count(), 4);

        cache.update().unwrap();
        assert_eq!(cache.open_count(), 2);

        // the two most recently opened survive
        let c = cache.open(&base.join("c"), OpenOptions::read_write_create()).unwrap();
        assert_eq!(cache.open_count(), 2);
        drop(c);
    }

    #[test]
    fn test_update_skips_leased_handles() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cache, base) = cache_in(dir.path(), 1);

        let lease_a = cache.open(&base.join("a"), OpenOptions::read_write_create()).unwrap();
        let lease_b = cache.open(&base.join("b"), OpenOptions::read_write_create()).unwrap();

        cache.update().unwrap();
        // both are leased, the bound cannot be enforced yet
        assert_eq!(cache.open_count(), 2);

        drop(lease_a);
        cache.update().unwrap();
        assert_eq!(cache.open_count(), 1);
        drop(lease_b);
    }

    #[test]
    fn test_eviction_flushes_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cache, base) = cache_in(dir.path(), 0);
        let path = base.join("a");

        {
            let handle = cache.open(&path, OpenOptions::read_write_create()).unwrap();
            let mut f = handle.borrow_mut();
            f.file.write_all(b"payload").unwrap();
            f.mark_dirty();
        }
        cache.update().unwrap();
        assert_eq!(cache.open_count(), 0);

        let handle = cache.open(&path, OpenOptions::read_write_create()).unwrap();
        let mut f = handle.borrow_mut();
        f.file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Vec::new();
        f.file.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"payload");
    }

    #[test]
    fn test_remove_forgets_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cache, base) = cache_in(dir.path(), 4);
        let path = base.join("a");

        cache.open(&path, OpenOptions::read_write_create()).unwrap();
        cache.remove(&path).unwrap();
        assert_eq!(cache.open_count(), 0);
        assert!(!path.exists());
    }
}
