//! Content-addressed cache of rule outputs and memoized shell inputs.
//!
//! Whole output sets are stored under the rule's cache key, one blob per
//! output (or per file of a directory output). Memoized shell inputs are
//! small text blobs addressed by the fingerprint scope at which the command
//! ran plus a hash of the command itself.
//!
//! A remote store can be shadowed by a local mirror: reads are answered by
//! the mirror when possible and every remote read or write is copied into
//! it. Mirror traffic never touches the public counters.

pub mod remote;
pub mod store;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::graph::Rule;
use crate::graph::paths::is_dir_path;
use crate::util::fs::{link_or_copy, remove_path};
use crate::util::hash::hash_output_path;

pub use remote::HttpStore;
pub use store::{BlobStore, DirectoryStore, MemoryStore};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("remote cache request for {name} failed: {message}")]
  Remote { name: String, message: String },

  #[error("corrupt cache entry {name}: {message}")]
  Corrupt { name: String, message: String },

  #[error("declared output {output} was not produced")]
  MissingOutput { output: String },

  #[error("cache store lock poisoned")]
  Poisoned,
}

/// Public cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
  hits: AtomicU64,
  misses: AtomicU64,
  inserts: AtomicU64,
}

/// A point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
  pub hits: u64,
  pub misses: u64,
  pub inserts: u64,
}

impl CacheStats {
  fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  fn insert(&self) {
    self.inserts.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CacheCounts {
    CacheCounts {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      inserts: self.inserts.load(Ordering::Relaxed),
    }
  }
}

/// A blob waiting to be placed into the destination tree.
enum Staged {
  Local(PathBuf),
  Bytes(Vec<u8>),
}

#[derive(Debug)]
pub struct Cache {
  store: Box<dyn BlobStore>,
  mirror: Option<Box<dyn BlobStore>>,
  stats: CacheStats,
}

impl Cache {
  pub fn new(store: Box<dyn BlobStore>, mirror: Option<Box<dyn BlobStore>>) -> Self {
    Self {
      store,
      mirror,
      stats: CacheStats::default(),
    }
  }

  /// A cache kept in a local directory.
  pub fn local(dir: impl Into<PathBuf>) -> Self {
    Self::new(Box::new(DirectoryStore::new(dir)), None)
  }

  /// A cache on a remote blob server, mirrored into `mirror_dir`.
  pub fn remote(base_url: &str, mirror_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
    Ok(Self::new(
      Box::new(HttpStore::new(base_url)?),
      Some(Box::new(DirectoryStore::new(mirror_dir))),
    ))
  }

  pub fn stats(&self) -> CacheCounts {
    self.stats.snapshot()
  }

  fn get(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
    if let Some(mirror) = &self.mirror
      && let Some(bytes) = mirror.read(name)?
    {
      return Ok(Some(bytes));
    }
    let bytes = self.store.read(name)?;
    if let (Some(mirror), Some(bytes)) = (&self.mirror, &bytes) {
      mirror.write(name, bytes)?;
    }
    Ok(bytes)
  }

  fn put(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
    self.store.write(name, bytes)?;
    if let Some(mirror) = &self.mirror {
      mirror.write(name, bytes)?;
    }
    Ok(())
  }

  fn local_path(&self, name: &str) -> Option<PathBuf> {
    match &self.mirror {
      Some(mirror) => mirror.local_path(name),
      None => self.store.local_path(name),
    }
  }

  /// Fetch a blob, preferring a local path that can be linked to.
  fn stage(&self, name: &str) -> Result<Option<Staged>, CacheError> {
    if let Some(path) = self.local_path(name) {
      return Ok(Some(Staged::Local(path)));
    }
    let Some(bytes) = self.get(name)? else {
      return Ok(None);
    };
    // A remote read has just populated the mirror.
    Ok(Some(match self.local_path(name) {
      Some(path) => Staged::Local(path),
      None => Staged::Bytes(bytes),
    }))
  }

  /// A memoized shell input recorded at fingerprint `scope`.
  pub fn fetch(&self, scope: &str, token: &str) -> Result<Option<String>, CacheError> {
    let name = memo_name(scope, token);
    let Some(bytes) = self.get(&name)? else {
      self.stats.miss();
      return Ok(None);
    };
    let text = String::from_utf8(bytes).map_err(|e| CacheError::Corrupt {
      name,
      message: e.to_string(),
    })?;
    self.stats.hit();
    Ok(Some(text))
  }

  pub fn memorize(&self, scope: &str, token: &str, output: &str) -> Result<(), CacheError> {
    self.put(&memo_name(scope, token), output.as_bytes())?;
    self.stats.insert();
    Ok(())
  }

  /// Materialise the outputs cached under `key` into `dest_root`.
  ///
  /// Every blob is located before the destination is touched. If any is
  /// missing the whole entry is treated as absent, purged, and `false` is
  /// returned.
  pub fn load(&self, key: &str, rule: &Rule, dest_root: &Path) -> Result<bool, CacheError> {
    let placed = self.restore(key, rule, dest_root)?;
    if placed {
      debug!(key, rule = %rule.label(), "cache hit");
      self.stats.hit();
    } else {
      self.stats.miss();
    }
    Ok(placed)
  }

  /// Like [`Cache::load`] but leaves the hit and miss counters alone.
  /// Used to swap freshly saved outputs for their cached links.
  pub(crate) fn restore(&self, key: &str, rule: &Rule, dest_root: &Path) -> Result<bool, CacheError> {
    let mut placements: Vec<(PathBuf, Staged)> = Vec::new();
    let mut dirs: Vec<PathBuf> = Vec::new();

    for output in &rule.outputs {
      let base = entry_name(key, output);
      let dest = dest_root.join(output.trim_end_matches('/'));
      if is_dir_path(output) {
        let manifest_name = format!("{base}.files");
        let Some(manifest) = self.get(&manifest_name)? else {
          return self.incomplete(key, &manifest_name);
        };
        let files: Vec<String> = serde_json::from_slice(&manifest).map_err(|e| CacheError::Corrupt {
          name: manifest_name.clone(),
          message: e.to_string(),
        })?;
        for rel in files {
          let name = format!("{base}/{rel}");
          let Some(staged) = self.stage(&name)? else {
            return self.incomplete(key, &name);
          };
          placements.push((dest.join(&rel), staged));
        }
        dirs.push(dest);
      } else {
        let Some(staged) = self.stage(&base)? else {
          return self.incomplete(key, &base);
        };
        placements.push((dest, staged));
      }
    }

    for output in &rule.outputs {
      let dest = dest_root.join(output.trim_end_matches('/'));
      remove_path(&dest).map_err(|source| CacheError::Io { path: dest, source })?;
    }
    for dir in dirs {
      fs::create_dir_all(&dir).map_err(|source| CacheError::Io { path: dir, source })?;
    }
    for (dest, staged) in placements {
      let placed = match staged {
        Staged::Local(src) => link_or_copy(&src, &dest, !rule.do_not_symlink),
        Staged::Bytes(bytes) => write_file(&dest, &bytes),
      };
      placed.map_err(|source| CacheError::Io { path: dest, source })?;
    }
    Ok(true)
  }

  fn incomplete(&self, key: &str, missing: &str) -> Result<bool, CacheError> {
    let existing = self.store.list(&format!("{key}/"))?;
    if !existing.is_empty() {
      warn!(key, missing, "purging incomplete cache entry");
      self.forget(key)?;
    }
    Ok(false)
  }

  /// Store the outputs of `rule`, found below `src_root`, under `key`.
  ///
  /// Directory file lists are written after their files, so an interrupted
  /// save looks like a miss rather than a partial hit.
  pub fn save(&self, key: &str, rule: &Rule, src_root: &Path) -> Result<(), CacheError> {
    for output in &rule.outputs {
      let base = entry_name(key, output);
      let src = src_root.join(output.trim_end_matches('/'));
      if !src.exists() {
        return Err(CacheError::MissingOutput { output: output.clone() });
      }
      if is_dir_path(output) {
        let mut files = Vec::new();
        for entry in WalkDir::new(&src).follow_links(true).sort_by_file_name() {
          let entry = entry.map_err(|e| CacheError::Io {
            path: src.clone(),
            source: e.into(),
          })?;
          if !entry.file_type().is_file() {
            continue;
          }
          let Ok(rel) = entry.path().strip_prefix(&src) else {
            continue;
          };
          let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
          self.put(&format!("{base}/{rel}"), &read_file(entry.path())?)?;
          files.push(rel);
        }
        let manifest = serde_json::to_vec(&files).map_err(|e| CacheError::Corrupt {
          name: base.clone(),
          message: e.to_string(),
        })?;
        self.put(&format!("{base}.files"), &manifest)?;
      } else {
        self.put(&base, &read_file(&src)?)?;
      }
    }
    debug!(key, rule = %rule.label(), "cache insert");
    self.stats.insert();
    Ok(())
  }

  /// Remove every blob stored under `key`, from the mirror too.
  pub fn forget(&self, key: &str) -> Result<(), CacheError> {
    let prefix = format!("{key}/");
    for name in self.store.list(&prefix)? {
      self.store.delete(&name)?;
    }
    if let Some(mirror) = &self.mirror {
      for name in mirror.list(&prefix)? {
        mirror.delete(&name)?;
      }
    }
    Ok(())
  }
}

fn memo_name(scope: &str, token: &str) -> String {
  format!("memo/{scope}/{token}")
}

fn entry_name(key: &str, output: &str) -> String {
  format!("{key}/{}", hash_output_path(output))
}

fn read_file(path: &Path) -> Result<Vec<u8>, CacheError> {
  fs::read(path).map_err(|source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  })
}

fn write_file(dest: &Path, bytes: &[u8]) -> io::Result<()> {
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)?;
  }
  remove_path(dest)?;
  fs::write(dest, bytes)
}
