//! Scratch directories holding exactly a rule's known dependencies.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crate::graph::paths::{is_rule_ref, parent_dir};
use crate::graph::{Rule, TargetGraph};
use crate::util::fs::copy_path;

#[derive(Debug, Error)]
pub enum SandboxError {
  #[error("failed to create sandbox: {0}")]
  Create(#[source] io::Error),

  #[error("failed to copy {path} into the sandbox: {source}")]
  Seed {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("{0} does not name a rule")]
  UnknownRule(String),
}

/// A temporary tree, removed on drop.
#[derive(Debug)]
pub struct Sandbox {
  dir: TempDir,
}

impl Sandbox {
  /// Create a sandbox for `rule` holding a copy of every path in `inputs`,
  /// taken from the live tree at `root`.
  ///
  /// `:name` inputs bring in every output of that rule. The rule's own
  /// directory and the parents of its outputs are created empty.
  pub fn seed(root: &Path, graph: &TargetGraph, rule: &Rule, inputs: &[String]) -> Result<Self, SandboxError> {
    let dir = tempfile::Builder::new()
      .prefix("rivet-sandbox-")
      .tempdir()
      .map_err(SandboxError::Create)?;
    let sandbox = Self { dir };

    for input in inputs {
      if is_rule_ref(input) {
        let producer = graph
          .lookup_name(input)
          .ok_or_else(|| SandboxError::UnknownRule(input.clone()))?;
        for output in &graph.rule(producer).outputs {
          sandbox.copy_in(root, output)?;
        }
      } else {
        sandbox.copy_in(root, input)?;
      }
    }

    sandbox.make_dir(&rule.dir)?;
    for output in &rule.outputs {
      sandbox.make_dir(parent_dir(output))?;
    }
    debug!(rule = %rule.label(), path = %sandbox.path().display(), inputs = inputs.len(), "seeded sandbox");
    Ok(sandbox)
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  fn copy_in(&self, root: &Path, path: &str) -> Result<(), SandboxError> {
    let rel = path.trim_end_matches('/');
    let src = root.join(rel);
    // Absent inputs stay absent; the rule fails on its own if it needs them.
    if !src.exists() {
      return Ok(());
    }
    copy_path(&src, &self.dir.path().join(rel)).map_err(|source| SandboxError::Seed {
      path: path.to_string(),
      source,
    })
  }

  fn make_dir(&self, rel: &str) -> Result<(), SandboxError> {
    let dir: PathBuf = self.dir.path().join(rel);
    fs::create_dir_all(&dir).map_err(|source| SandboxError::Seed {
      path: rel.to_string(),
      source,
    })
  }
}
