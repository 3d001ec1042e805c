//! Hashing utilities for cache keys and content verification.
//!
//! - `Fingerprint`: an order-sensitive running digest used as cache key and,
//!   mid-sequence, as the scope for memoized shell inputs
//! - `hash_path()`: digest of what a file or directory currently holds
//! - `hash_bytes()`: digest of a byte string

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A running, order-sensitive SHA-256 digest.
///
/// Every value is length-prefixed before it is mixed in, so the boundaries
/// between consecutive updates are part of the digest: `update(b"ab")`
/// followed by `update(b"c")` differs from `update(b"a")` then `update(b"bc")`.
///
/// `snapshot()` does not consume or reset the state, which lets the same
/// fingerprint serve as a namespace for sub-results halfway through a rule
/// and as the final cache key at the end.
#[derive(Clone, Default)]
pub struct Fingerprint {
  hasher: Sha256,
}

impl Fingerprint {
  pub fn new() -> Self {
    Self::default()
  }

  /// Mix the canonical JSON text of a structured value.
  ///
  /// `serde_json::Value` maps are ordered, so equal values always produce the
  /// same text.
  pub fn record(&mut self, value: &serde_json::Value) {
    self.update(value.to_string().as_bytes());
  }

  /// Mix raw bytes, prefixed with their length.
  pub fn update(&mut self, bytes: &[u8]) {
    self.hasher.update((bytes.len() as u64).to_le_bytes());
    self.hasher.update(bytes);
  }

  /// Mix the content found at `path`.
  ///
  /// Files contribute their bytes. Directories contribute every regular file
  /// below them as `(relative path, bytes)` pairs in sorted order.
  pub fn update_path(&mut self, path: &Path) -> Result<(), DirHashError> {
    if path.is_dir() {
      self.update(b"dir");
      for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
        if !entry.path().is_file() {
          continue;
        }
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        self.update(rel.to_string_lossy().as_bytes());
        self.update(&read_file(entry.path())?);
      }
    } else {
      self.update(b"file");
      self.update(&read_file(path)?);
    }
    Ok(())
  }

  /// Hex digest of everything mixed in so far.
  pub fn snapshot(&self) -> String {
    hex::encode(self.hasher.clone().finalize())
  }
}

impl std::fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Fingerprint").field(&self.snapshot()).finish()
  }
}

/// Hex SHA-256 digest identifying some content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },
}

fn read_file(path: &Path) -> Result<Vec<u8>, DirHashError> {
  fs::read(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })
}

/// Digest of a file's bytes, or of every file below a directory.
///
/// Agrees with what [`Fingerprint::update_path`] mixes in, so a setup record
/// and a cache key see the same change.
pub fn hash_path(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut fp = Fingerprint::new();
  fp.update_path(path)?;
  Ok(ContentHash(fp.snapshot()))
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

/// Name of an output's slot inside a cache entry.
pub fn hash_output_path(output: &str) -> String {
  hash_bytes(output.as_bytes()).0[..32].to_string()
}
