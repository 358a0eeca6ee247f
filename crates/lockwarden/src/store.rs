//! named-blob store
//!
//! the file-store collaborator: one blob per name. the grant protocol keeps
//! persisted outstanding requests here, the lockout engine keeps its wrapped
//! secret and config.
//!
//! implementations:
//! - memory: in-memory for testing
//! - dir: one file per blob, used by the simulator

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::{Error, Result};

/// blob store trait - pluggable persistent storage
pub trait BlobStore: Send + Sync {
    /// write (replace) a blob
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// read a blob, `None` if absent
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// whether a blob exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// delete a blob; deleting a missing blob is not an error
    fn delete(&self, name: &str) -> Result<()>;
}

impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        (**self).write(name, bytes)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        (**self).read(name)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        (**self).exists(name)
    }

    fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name)
    }
}

fn check_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b));
    if ok {
        Ok(())
    } else {
        Err(Error::Storage(format!("invalid blob name: {:?}", name)))
    }
}

/// in-memory blob store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        check_name(name)?;
        let mut blobs = self.blobs.write().map_err(|e| Error::Storage(e.to_string()))?;
        blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        check_name(name)?;
        let blobs = self.blobs.read().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(blobs.get(name).cloned())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let blobs = self.blobs.read().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(blobs.contains_key(name))
    }

    fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let mut blobs = self.blobs.write().map_err(|e| Error::Storage(e.to_string()))?;
        blobs.remove(name);
        Ok(())
    }
}

/// directory-backed blob store, one file per blob
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::Storage(format!("{}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }
}

impl BlobStore for DirStore {
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        // write then rename so a crash never leaves a half blob
        let tmp = self.root.join(format!(".{}.tmp", name));
        fs::write(&tmp, bytes).map_err(|e| Error::Storage(format!("{}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path).map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("{}: {}", path.display(), e))),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name)?.is_file())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("{}: {}", path.display(), e))),
        }
    }
}
