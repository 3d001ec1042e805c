//! Tracked source files and glob matching over them.
//!
//! The source set is enumerated once per invocation by walking the
//! repository with the `ignore` crate (so `.gitignore` rules apply) and is
//! then shared read-only by every loader and worker.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use tracing::{debug, trace};

use super::GraphError;
use super::paths::{ancestors, is_dir_path};
use crate::consts::{GIT_DIR, STATE_DIR};
use crate::depset::{DepSet, DepSetItem};

/// The set of tracked source files of a repository.
#[derive(Debug, Default)]
pub struct SourceSet {
  root: PathBuf,
  files: BTreeSet<String>,
  dirs: BTreeSet<String>,
  /// Paths declared as rule outputs, excluded from glob results. Set once
  /// the first loader of this tree is sealed.
  generated: OnceLock<Generated>,
}

#[derive(Debug, Default)]
struct Generated {
  files: HashSet<String>,
  dirs: HashSet<String>,
}

impl Generated {
  fn covers(&self, path: &str) -> bool {
    self.files.contains(path) || ancestors(path).any(|dir| self.dirs.contains(&dir))
  }
}

impl SourceSet {
  /// Enumerate the tracked files below `root`.
  ///
  /// `excluded` holds repo-relative directories (with trailing `/`) whose
  /// contents are generated and therefore never sources.
  pub fn scan(root: &Path, excluded: &[String]) -> Result<Self, ignore::Error> {
    let owned_root = root.to_path_buf();
    let mut skip: Vec<String> = vec![format!("{GIT_DIR}/"), format!("{STATE_DIR}/")];
    skip.extend(excluded.iter().cloned());

    let mut builder = WalkBuilder::new(root);
    builder
      .hidden(false)
      .parents(false)
      .require_git(false)
      .sort_by_file_name(|a, b| a.cmp(b))
      .filter_entry(move |entry| {
        let Some(rel) = relative_path(&owned_root, entry.path()) else {
          return true;
        };
        let as_dir = format!("{rel}/");
        !skip.iter().any(|s| as_dir.starts_with(s.as_str()))
      });

    let mut paths = Vec::new();
    for entry in builder.build() {
      let entry = entry?;
      if !entry.file_type().is_some_and(|t| t.is_file() || t.is_symlink()) {
        continue;
      }
      if let Some(rel) = relative_path(root, entry.path()) {
        paths.push(rel);
      }
    }

    debug!(count = paths.len(), root = %root.display(), "enumerated sources");
    Ok(Self::from_paths(root, paths))
  }

  /// Build a source set from already-known repo-relative paths.
  pub fn from_paths(root: &Path, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();
    for path in paths {
      let path = path.into();
      dirs.extend(ancestors(&path));
      files.insert(path);
    }
    Self {
      root: root.to_path_buf(),
      files,
      dirs,
      generated: OnceLock::new(),
    }
  }

  /// Record the outputs of the loaded rules so that globs skip them even
  /// when a previous build left them in the tree.
  ///
  /// Every loader of one tree declares the same outputs, so only the first
  /// call takes effect.
  pub fn exclude_outputs<'a>(&self, outputs: impl IntoIterator<Item = &'a str>) {
    let mut generated = Generated::default();
    for output in outputs {
      if is_dir_path(output) {
        generated.dirs.insert(output.to_string());
      } else {
        generated.files.insert(output.to_string());
      }
    }
    if self.generated.set(generated).is_err() {
      trace!("rule outputs already recorded");
    }
  }

  /// Whether `path` is, or lies inside, a recorded rule output.
  pub fn is_generated(&self, path: &str) -> bool {
    self.generated.get().is_some_and(|g| g.covers(path))
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Whether `path` is a tracked file, or (with a trailing `/`) a directory
  /// containing tracked files.
  pub fn contains(&self, path: &str) -> bool {
    self.files.contains(path) || self.dirs.contains(path)
  }

  pub fn files(&self) -> impl Iterator<Item = &str> {
    self.files.iter().map(String::as_str)
  }

  /// Tracked files named `file_name`, in sorted order.
  pub fn named<'a>(&'a self, file_name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self
      .files()
      .filter(move |f| f.rsplit('/').next() == Some(file_name))
  }

  /// A deferred set of the tracked files under `dir` matching `pattern`.
  ///
  /// The pattern is compiled immediately so that syntax errors surface while
  /// loading; matching happens on first access to the set. Rule outputs are
  /// never matched.
  pub fn glob(self: &Arc<Self>, dir: &str, pattern: &str) -> Result<DepSet, GraphError> {
    let anchored = if dir.is_empty() {
      format!("/{pattern}")
    } else {
      format!("/{dir}/{pattern}")
    };
    let glob_err = |e: ignore::Error| GraphError::Glob {
      pattern: pattern.to_string(),
      message: e.to_string(),
    };
    let mut builder = OverrideBuilder::new(&self.root);
    builder.add(&anchored).map_err(glob_err)?;
    let matcher = builder.build().map_err(glob_err)?;

    let sources = Arc::clone(self);
    Ok(DepSet::deferred(move || {
      sources
        .files()
        .filter(|f| matcher.matched(f, false).is_whitelist() && !sources.is_generated(f))
        .map(DepSetItem::from)
        .collect()
    }))
  }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
  let rel = path.strip_prefix(root).ok()?;
  if rel.as_os_str().is_empty() {
    return None;
  }
  Some(
    rel
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/"),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  fn sample() -> Arc<SourceSet> {
    Arc::new(SourceSet::from_paths(
      Path::new("/repo"),
      ["src/a.c", "src/b.c", "src/util/c.c", "src/notes.md", "top.c"],
    ))
  }

  #[test]
  fn contains_files_and_their_directories() {
    let sources = sample();
    assert!(sources.contains("src/a.c"));
    assert!(sources.contains("src/util/"));
    assert!(!sources.contains("src/missing.c"));
  }

  #[test]
  fn glob_is_relative_to_the_directory_and_single_level() {
    let sources = sample();
    let set = sources.glob("src", "*.c").unwrap();
    assert_eq!(set.flatten(), vec!["src/a.c", "src/b.c"]);
  }

  #[test]
  fn glob_double_star_crosses_directories() {
    let sources = sample();
    let set = sources.glob("src", "**/*.c").unwrap();
    assert_eq!(set.flatten(), vec!["src/a.c", "src/b.c", "src/util/c.c"]);
  }

  #[test]
  fn glob_at_root_does_not_match_nested_files() {
    let sources = sample();
    assert_eq!(sources.glob("", "*.c").unwrap().flatten(), vec!["top.c"]);
  }

  #[test]
  fn glob_skips_rule_outputs() {
    let sources = Arc::new(SourceSet::from_paths(
      Path::new("/repo"),
      ["a.txt", "b.txt", "bundle.txt", "gen/x.txt", "gen/sub/y.txt"],
    ));
    let set = sources.glob("", "**/*.txt").unwrap();
    sources.exclude_outputs(["bundle.txt", "gen/"]);
    assert_eq!(set.flatten(), vec!["a.txt", "b.txt"]);
    assert!(sources.is_generated("gen/sub/y.txt"));
    assert!(!sources.is_generated("general.txt"));
    assert!(sources.contains("bundle.txt"));
  }

  #[test]
  fn scan_skips_state_gitignored_and_output_dirs() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join(".rivet/cache")).unwrap();
    fs::create_dir_all(root.join("dist")).unwrap();
    fs::create_dir_all(root.join("ignored")).unwrap();
    fs::write(root.join("src/main.c"), "").unwrap();
    fs::write(root.join(".rivet/cache/blob"), "").unwrap();
    fs::write(root.join("dist/bundle.js"), "").unwrap();
    fs::write(root.join("ignored/x"), "").unwrap();
    fs::write(root.join(".gitignore"), "ignored/\n").unwrap();

    let sources = SourceSet::scan(root, &["dist/".to_string()]).unwrap();
    let files: Vec<&str> = sources.files().collect();
    assert_eq!(files, vec![".gitignore", "src/main.c"]);
  }
}
