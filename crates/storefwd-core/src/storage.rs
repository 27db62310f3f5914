//! Block storage seam
//!
//! Persistence reaches the host filesystem only through this trait, which
//! keeps the crash-consistency discipline (temp file, sync, rename)
//! testable against an in-memory backend.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

// ----------------------------------------------------------------------------
// Storage Trait
// ----------------------------------------------------------------------------

/// Persistent store consumed by the persistence layer
///
/// Paths are relative, `/`-separated, and interpreted against the backend's
/// root. Writers returned by `open_write` must durably commit their contents
/// on `flush`.
pub trait Storage {
    fn exists(&self, path: &str) -> bool;
    fn mkdir(&mut self, path: &str) -> io::Result<()>;
    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read>>;
    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn Write>>;
    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;
    fn remove(&mut self, path: &str) -> io::Result<()>;
}

// ----------------------------------------------------------------------------
// Filesystem Backend
// ----------------------------------------------------------------------------

/// Storage rooted at a directory on the host filesystem
#[derive(Debug)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

/// File wrapper whose `flush` also syncs to the device, so a following
/// rename lands after the data.
struct SyncedFile(File);

impl Write for SyncedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.sync_all()
    }
}

impl Storage for FsStorage {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn mkdir(&mut self, path: &str) -> io::Result<()> {
        fs::create_dir_all(self.resolve(path))
    }

    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(self.resolve(path))?))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn Write>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(path))?;
        Ok(Box::new(SyncedFile(file)))
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }
}

// ----------------------------------------------------------------------------
// In-Memory Backend
// ----------------------------------------------------------------------------

type FileMap = Rc<RefCell<HashMap<String, Vec<u8>>>>;

/// In-memory storage for tests; contents are inspectable through a shared
/// handle
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: FileMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the stored files (same map as the storage itself)
    pub fn handle(&self) -> MemoryStorageHandle {
        MemoryStorageHandle {
            files: Rc::clone(&self.files),
        }
    }
}

/// Inspection handle over a `MemoryStorage`
#[derive(Debug, Clone)]
pub struct MemoryStorageHandle {
    files: FileMap,
}

impl MemoryStorageHandle {
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).cloned()
    }

    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files.borrow_mut().insert(path.to_string(), bytes);
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Writer that commits its buffer into the file map when dropped
struct MemoryWriter {
    files: FileMap,
    path: String,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.files
            .borrow_mut()
            .insert(self.path.clone(), self.buf.clone());
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    fn mkdir(&mut self, _path: &str) -> io::Result<()> {
        Ok(())
    }

    fn open_read(&mut self, path: &str) -> io::Result<Box<dyn Read>> {
        let bytes = self
            .files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn open_write(&mut self, path: &str) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(MemoryWriter {
            files: Rc::clone(&self.files),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        let mut files = self.files.borrow_mut();
        let bytes = files
            .remove(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.to_string()))?;
        files.insert(to.to_string(), bytes);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.files
            .borrow_mut()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let mut storage = MemoryStorage::new();
        let handle = storage.handle();

        {
            let mut w = storage.open_write("history/sf.tmp").unwrap();
            w.write_all(b"abc").unwrap();
            w.flush().unwrap();
        }
        storage.rename("history/sf.tmp", "history/sf").unwrap();

        assert!(storage.exists("history/sf"));
        assert!(!storage.exists("history/sf.tmp"));
        assert_eq!(handle.contents("history/sf").unwrap(), b"abc");

        let mut read_back = Vec::new();
        storage
            .open_read("history/sf")
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, b"abc");
    }

    #[test]
    fn test_fs_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path());

        storage.mkdir("history").unwrap();
        {
            let mut w = storage.open_write("history/sf.tmp").unwrap();
            w.write_all(b"payload").unwrap();
            w.flush().unwrap();
        }
        storage.rename("history/sf.tmp", "history/sf").unwrap();

        assert!(storage.exists("history/sf"));
        let mut read_back = Vec::new();
        storage
            .open_read("history/sf")
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, b"payload");

        storage.remove("history/sf").unwrap();
        assert!(!storage.exists("history/sf"));
    }
}
