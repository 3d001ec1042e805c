//! Target graph: rules and the structure resolving a path or name to the
//! rule that produces it.
//!
//! Outputs are indexed twice: exact file outputs, and directory outputs
//! (keys with a trailing `/`) which own everything beneath them. A path that
//! no rule produces may still be a tracked source file.

pub mod paths;
mod rule;
pub mod sources;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::util::hash::Fingerprint;

pub use rule::{Rule, RuleDecl, RuleId};
pub use sources::SourceSet;

use paths::{ancestors, is_dir_path, is_rule_ref};

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("duplicate producer for {path}: already produced by {existing}")]
  DuplicateProducer { path: String, existing: String },

  #[error("duplicate rule name :{0}")]
  DuplicateName(String),

  #[error("output {path} of {rule} overlaps directory output {dir} of {owner}")]
  OverlappingOutputs {
    path: String,
    rule: String,
    dir: String,
    owner: String,
  },

  /// The scheduler asked for something loading never registered.
  #[error("unresolved dependency {0}: no rule produces it and it is not a tracked source")]
  Unresolved(String),

  #[error("invalid path {path}: {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("invalid glob pattern {pattern}: {message}")]
  Glob { pattern: String, message: String },

  #[error("rule declares no outputs")]
  NoOutputs,
}

/// All rules of a repository plus their output index.
#[derive(Debug)]
pub struct TargetGraph {
  rules: Vec<Rule>,
  files: HashMap<String, RuleId>,
  dirs: HashMap<String, RuleId>,
  names: HashMap<String, RuleId>,
  sources: Arc<SourceSet>,
}

impl TargetGraph {
  pub fn new(sources: Arc<SourceSet>) -> Self {
    Self {
      rules: Vec::new(),
      files: HashMap::new(),
      dirs: HashMap::new(),
      names: HashMap::new(),
      sources,
    }
  }

  /// Register a rule, failing if its name or any of its outputs is taken.
  ///
  /// Nothing is inserted unless every check passes.
  pub fn register(&mut self, decl: RuleDecl) -> Result<RuleId, GraphError> {
    if decl.outputs.is_empty() {
      return Err(GraphError::NoOutputs);
    }
    if let Some(name) = &decl.name
      && self.names.contains_key(name)
    {
      return Err(GraphError::DuplicateName(name.clone()));
    }
    for (i, output) in decl.outputs.iter().enumerate() {
      let index = if is_dir_path(output) { &self.dirs } else { &self.files };
      if let Some(&existing) = index.get(output) {
        return Err(GraphError::DuplicateProducer {
          path: output.clone(),
          existing: self.rules[existing].label(),
        });
      }
      if decl.outputs[..i].contains(output) {
        return Err(GraphError::DuplicateProducer {
          path: output.clone(),
          existing: "the same rule".to_string(),
        });
      }
    }

    let id = self.rules.len();
    for output in &decl.outputs {
      if is_dir_path(output) {
        self.dirs.insert(output.clone(), id);
      } else {
        self.files.insert(output.clone(), id);
      }
    }
    if let Some(name) = &decl.name {
      self.names.insert(name.clone(), id);
    }
    self.rules.push(Rule {
      id,
      name: decl.name,
      dir: decl.dir,
      build_file: decl.build_file,
      deps: decl.deps,
      outputs: decl.outputs,
      do_not_symlink: decl.do_not_symlink,
    });
    Ok(id)
  }

  pub fn rule(&self, id: RuleId) -> &Rule {
    &self.rules[id]
  }

  pub fn rules(&self) -> &[Rule] {
    &self.rules
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  pub fn sources(&self) -> &Arc<SourceSet> {
    &self.sources
  }

  pub fn lookup_name(&self, name: &str) -> Option<RuleId> {
    self.names.get(name.trim_start_matches(':')).copied()
  }

  /// The rule producing `path`.
  ///
  /// Exact file outputs win; otherwise the enclosing directories are searched
  /// innermost first for a directory output. `Ok(None)` means `path` is a
  /// tracked source that nothing produces.
  pub fn lookup(&self, path: &str) -> Result<Option<RuleId>, GraphError> {
    if is_rule_ref(path) {
      return self
        .lookup_name(path)
        .map(Some)
        .ok_or_else(|| GraphError::Unresolved(path.to_string()));
    }
    let exact = if is_dir_path(path) { &self.dirs } else { &self.files };
    if let Some(&id) = exact.get(path) {
      return Ok(Some(id));
    }
    for dir in ancestors(path) {
      if let Some(&id) = self.dirs.get(&dir) {
        return Ok(Some(id));
      }
    }
    if self.sources.contains(path) {
      return Ok(None);
    }
    Err(GraphError::Unresolved(path.to_string()))
  }

  /// Whether `path` is a tracked source file with no producing rule.
  pub fn is_source(&self, path: &str) -> bool {
    matches!(self.lookup(path), Ok(None))
  }

  /// Check that no registered output sits inside, or coincides with, a
  /// directory output.
  pub fn verify(&self) -> Result<(), GraphError> {
    let registered = self.files.iter().chain(self.dirs.iter());
    for (path, &id) in registered {
      let mut clashes = ancestors(path).filter_map(|dir| self.dirs.get(&dir).map(|&owner| (dir, owner)));
      let same_as_dir = if is_dir_path(path) {
        None
      } else {
        let as_dir = format!("{path}/");
        self.dirs.get(&as_dir).map(|&owner| (as_dir, owner))
      };
      if let Some((dir, owner)) = same_as_dir.or_else(|| clashes.next()) {
        return Err(GraphError::OverlappingOutputs {
          path: path.clone(),
          rule: self.rules[id].label(),
          dir,
          owner: self.rules[owner].label(),
        });
      }
    }
    Ok(())
  }

  /// Digest of every rule's identity, used to check that two independently
  /// evaluated copies of the same build files agree.
  pub fn signature(&self) -> String {
    let mut fp = Fingerprint::new();
    for rule in &self.rules {
      fp.record(&serde_json::json!([rule.name, rule.dir, rule.outputs]));
    }
    fp.snapshot()
  }
}
