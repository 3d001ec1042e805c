//! Types for build execution.
//!
//! This module defines the error type, the options, and the report of one
//! build invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cache::{CacheCounts, CacheError};
use crate::consts::{CACHE_SUBDIR, STATE_DIR};
use crate::context::ContextError;
use crate::graph::GraphError;
use crate::lua::{Flags, LoadError};
use crate::sandbox::SandboxError;

/// Errors that end a build.
///
/// Everything except [`BuildError::Internal`] (and unresolved graph lookups
/// reached by the scheduler) is the user's to fix.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error("no WORKSPACE.lua found in {} or any parent directory", .0.display())]
  NoWorkspace(PathBuf),

  #[error("no target given and WORKSPACE.lua registers no default build rule")]
  NoTarget,

  #[error("unknown target {0}")]
  UnknownTarget(String),

  #[error("failed to enumerate sources: {0}")]
  Sources(#[from] ignore::Error),

  #[error(transparent)]
  Load(#[from] LoadError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Sandbox(#[from] SandboxError),

  /// A rule failed: its implementation errored, a command failed, or it
  /// read something it does not declare.
  #[error("{rule}: {source}")]
  Rule {
    rule: String,
    #[source]
    source: ContextError,
  },

  #[error("dependency cycle among {}", .0.join(", "))]
  Cycle(Vec<String>),

  #[error("i/o error at {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to record setup rule {rule}: {message}")]
  SetupRecord { rule: String, message: String },

  /// The engine contradicted itself.
  #[error("{0}")]
  Internal(String),
}

impl BuildError {
  /// Whether this reports a defect in the engine rather than in the build.
  pub fn is_internal(&self) -> bool {
    match self {
      BuildError::Internal(_) => true,
      BuildError::Rule {
        source: ContextError::Graph(GraphError::Unresolved(_)),
        ..
      } => true,
      _ => false,
    }
  }

  pub(crate) fn rule(rule: String, source: ContextError) -> Self {
    BuildError::Rule { rule, source }
  }
}

/// Where build outputs are cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CacheLocation {
  /// `.rivet/cache` below the workspace root.
  #[default]
  Default,
  Directory(PathBuf),
  /// An HTTP blob store, mirrored locally.
  Remote(String),
}

impl CacheLocation {
  /// Interpret a `--cache-directory` argument.
  pub fn parse(arg: &str) -> Self {
    if arg.starts_with("http://") || arg.starts_with("https://") {
      CacheLocation::Remote(arg.to_string())
    } else {
      CacheLocation::Directory(PathBuf::from(arg))
    }
  }

  /// Local directory backing this location, for a workspace at `root`.
  pub fn local_dir(&self, root: &Path) -> Option<PathBuf> {
    match self {
      CacheLocation::Default => Some(root.join(STATE_DIR).join(CACHE_SUBDIR)),
      CacheLocation::Directory(dir) if dir.is_absolute() => Some(dir.clone()),
      CacheLocation::Directory(dir) => Some(root.join(dir)),
      CacheLocation::Remote(_) => None,
    }
  }
}

/// Configuration for one build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
  /// Number of worker threads.
  pub threads: usize,

  pub cache: CacheLocation,

  /// `--flag key=value` pairs, visible to build files as `rivet.flags`.
  pub flags: Flags,

  /// Collect per-rule timings.
  pub profile: bool,
}

impl Default for BuildOptions {
  fn default() -> Self {
    Self {
      threads: num_cpus(),
      cache: CacheLocation::Default,
      flags: Flags::new(),
      profile: false,
    }
  }
}

/// Get the number of CPUs for default parallelism.
pub fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// How a rule's outputs came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Restored from the cache.
  CacheHit,
  /// Run once in a sandbox with its dependencies known up front.
  Sandboxed,
  /// Run live to discover its dependencies, then verified in a sandbox.
  Discovered,
  /// A setup rule run against the live tree.
  Setup,
  /// A setup rule whose previous result still holds.
  SetupSkipped,
}

impl std::fmt::Display for Outcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Outcome::CacheHit => "cached",
      Outcome::Sandboxed => "built",
      Outcome::Discovered => "discovered",
      Outcome::Setup => "setup",
      Outcome::SetupSkipped => "setup (unchanged)",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone)]
pub struct RuleTiming {
  pub rule: String,
  pub outcome: Outcome,
  pub elapsed: Duration,
}

/// Result of a successful build.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Label of the requested target.
  pub target: String,

  /// Cache key of every rule the scheduler completed, by label. Setup rules
  /// are counted separately.
  pub keys: BTreeMap<String, String>,

  pub previews: usize,
  pub cache_hits: usize,
  pub sandboxed_runs: usize,
  pub discovery_runs: usize,
  pub setup_runs: usize,
  pub setup_skipped: usize,

  pub cache: CacheCounts,

  /// Per-rule timings, slowest first. Empty unless profiling.
  pub timings: Vec<RuleTiming>,

  pub elapsed: Duration,
}

impl BuildReport {
  /// Rules whose commands ran in this invocation.
  pub fn executed(&self) -> usize {
    self.keys.len().saturating_sub(self.cache_hits)
  }
}
