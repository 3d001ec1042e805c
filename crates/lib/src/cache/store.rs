//! Blob stores backing the cache.
//!
//! A store is a flat namespace of named byte blobs. Names use `/` as a
//! separator so that a directory-backed store can lay them out as a tree:
//!
//! ```text
//! .rivet/cache/
//!   <cache key>/
//!     <hash(output)>              # file output
//!     <hash(output)>/<rel path>   # one file of a directory output
//!     <hash(output)>.files        # file list of a directory output
//!   memo/<scope>/<token>          # memoized shell input
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::CacheError;

/// Read/write/list/delete access to named blobs.
pub trait BlobStore: Send + Sync + fmt::Debug {
  /// The blob's bytes, or `None` if it does not exist.
  fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError>;

  /// Create or replace a blob.
  fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError>;

  /// Names of every blob starting with `prefix`.
  fn list(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

  /// Remove a blob. Removing a missing blob is not an error.
  fn delete(&self, name: &str) -> Result<(), CacheError>;

  /// Path of an existing blob on the local filesystem, for stores that have
  /// one. Materialised outputs symlink to it.
  fn local_path(&self, _name: &str) -> Option<PathBuf> {
    None
  }
}

/// A store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
  root: PathBuf,
}

impl DirectoryStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn path_of(&self, name: &str) -> PathBuf {
    self.root.join(name)
  }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
  move |source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  }
}

impl BlobStore for DirectoryStore {
  fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let path = self.path_of(name);
    match fs::read(&path) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(io_err(&path)(e)),
    }
  }

  /// Writes go through a temporary file in the same directory, so readers
  /// never observe a half-written blob.
  fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
    let path = self.path_of(name);
    let parent = path.parent().unwrap_or(&self.root);
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let mut temp = NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    temp.write_all(bytes).map_err(io_err(&path))?;
    temp.persist(&path).map_err(|e| io_err(&path)(e.error))?;
    Ok(())
  }

  fn list(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
    // Only walk the deepest directory the prefix pins down.
    let base = match prefix.rfind('/') {
      Some(i) => self.root.join(&prefix[..i]),
      None => self.root.clone(),
    };
    if !base.exists() {
      return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in WalkDir::new(&base).sort_by_file_name() {
      let entry = entry.map_err(|e| CacheError::Io {
        path: base.clone(),
        source: e.into(),
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      let Ok(rel) = entry.path().strip_prefix(&self.root) else {
        continue;
      };
      let name = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
      if name.starts_with(prefix) {
        names.push(name);
      }
    }
    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<(), CacheError> {
    let path = self.path_of(name);
    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(io_err(&path)(e)),
    }
  }

  fn local_path(&self, name: &str) -> Option<PathBuf> {
    let path = self.path_of(name);
    path.is_file().then_some(path)
  }
}

/// An in-process store, for tests and throwaway builds.
#[derive(Debug, Default)]
pub struct MemoryStore {
  blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.blobs.lock().map(|b| b.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn blobs(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, CacheError> {
    self.blobs.lock().map_err(|_| CacheError::Poisoned)
  }
}

impl BlobStore for MemoryStore {
  fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
    Ok(self.blobs()?.get(name).cloned())
  }

  fn write(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
    self.blobs()?.insert(name.to_string(), bytes.to_vec());
    Ok(())
  }

  fn list(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
    Ok(
      self
        .blobs()?
        .range(prefix.to_string()..)
        .take_while(|(name, _)| name.starts_with(prefix))
        .map(|(name, _)| name.clone())
        .collect(),
    )
  }

  fn delete(&self, name: &str) -> Result<(), CacheError> {
    self.blobs()?.remove(name);
    Ok(())
  }
}
