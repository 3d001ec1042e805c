//! Filesystem helpers shared by the sandbox and the cache layer.

use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

/// Copy a file or a whole directory tree from `src` to `dest`.
///
/// Parent directories of `dest` are created. Symlinks are followed, so the
/// destination always holds real content.
pub fn copy_path(src: &Path, dest: &Path) -> io::Result<()> {
  if src.is_dir() {
    for entry in WalkDir::new(src).follow_links(true) {
      let entry = entry.map_err(io::Error::other)?;
      let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
      let target = dest.join(rel);
      if entry.file_type().is_dir() {
        fs::create_dir_all(&target)?;
      } else {
        copy_file(entry.path(), &target)?;
      }
    }
    Ok(())
  } else {
    copy_file(src, dest)
  }
}

fn copy_file(src: &Path, dest: &Path) -> io::Result<()> {
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)?;
  }
  remove_path(dest)?;
  fs::copy(src, dest)?;
  Ok(())
}

/// Place `src` at `dest`, either as a symlink or as a copy.
pub fn link_or_copy(src: &Path, dest: &Path, symlink: bool) -> io::Result<()> {
  if !symlink {
    return copy_path(src, dest);
  }
  if let Some(parent) = dest.parent() {
    fs::create_dir_all(parent)?;
  }
  remove_path(dest)?;
  create_symlink(src, dest)
}

/// Remove a file, symlink or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
  match fs::symlink_metadata(path) {
    Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
    Ok(_) => fs::remove_file(path),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

#[cfg(unix)]
fn create_symlink(src: &Path, dest: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(src, dest)
}

#[cfg(windows)]
fn create_symlink(src: &Path, dest: &Path) -> io::Result<()> {
  if src.is_dir() {
    std::os::windows::fs::symlink_dir(src, dest)
  } else {
    std::os::windows::fs::symlink_file(src, dest)
  }
}
