//! Execution contexts: the recording substrate rule implementations run in.
//!
//! Every primitive a rule may call (declare dependencies, run a command,
//! read a file or a command's output) first records a canonical description
//! of the call into the rule's running [`Fingerprint`], then takes effect.
//! The final digest is the rule's cache key; the digest at the moment a
//! shell input is requested scopes that input's memoization.
//!
//! Three variants implement the effects differently:
//!
//! - [`PreviewContext`] never runs anything and answers shell inputs from
//!   the memo cache only
//! - [`ExecuteContext`] queues commands, flushes them at every dependency or
//!   input boundary, and memoizes shell inputs
//! - [`WorkspaceContext`] runs commands immediately, for setup rules

mod execute;
mod preview;
mod workspace;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use crate::cache::{Cache, CacheError};
use crate::graph::paths::is_rule_ref;
use crate::graph::{GraphError, RuleId, TargetGraph};
use crate::util::hash::{DirHashError, Fingerprint, hash_bytes};
use crate::value::Value;

pub use execute::ExecuteContext;
pub use preview::PreviewContext;
pub use workspace::WorkspaceContext;

/// Environment variables passed to a command.
pub type Env = BTreeMap<String, String>;

/// Answers whether a rule's outputs are available yet, and what it produced.
pub trait DependencyState: Send + Sync {
  fn is_ready(&self, id: RuleId) -> bool;

  fn value(&self, id: RuleId) -> Option<Value>;
}

#[derive(Debug, Error)]
pub enum ContextError {
  /// Control flow: these dependencies must be built first.
  #[error("dependencies not built yet: {}", .0.join(", "))]
  Missing(Vec<String>),

  /// Control flow: a shell input has no memoized answer, so the full
  /// dependency set cannot be known without running the rule.
  #[error("output of `{command}` is not known yet")]
  Unknowable { command: String },

  #[error("command `{command}` failed with {status}\n{stderr}")]
  CommandFailed {
    command: String,
    status: String,
    stderr: String,
  },

  /// A command failed in a sandbox holding exactly the declared inputs.
  #[error(
    "command `{command}` failed with {status} inside the sandbox; the rule needs inputs it does not declare\n{stderr}"
  )]
  UnderDeclared {
    command: String,
    status: String,
    stderr: String,
  },

  #[error("failed to run `{command}`: {source}")]
  Spawn {
    command: String,
    #[source]
    source: io::Error,
  },

  #[error("{0} is neither a tracked source nor a declared output")]
  UnknownInput(String),

  #[error("failed to read input {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The implementation raised an error or returned an unusable value.
  #[error("{message}")]
  Rule { rule: String, message: String },

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Graph(#[from] GraphError),
}

impl ContextError {
  /// Whether this is a scheduling signal rather than a failure.
  pub fn is_signal(&self) -> bool {
    matches!(self, ContextError::Missing(_) | ContextError::Unknowable { .. })
  }
}

/// State shared by every context variant.
pub struct ContextBase {
  pub rule: RuleId,
  /// The rule's directory, relative to `root`.
  pub dir: String,
  /// Tree the rule observes: the live repository or a sandbox.
  pub root: PathBuf,
  pub graph: Arc<TargetGraph>,
  pub cache: Arc<Cache>,
  pub deps: Arc<dyn DependencyState>,
  fingerprint: Fingerprint,
  inputs: Vec<String>,
  seen: HashSet<String>,
  failure: Option<ContextError>,
}

impl ContextBase {
  pub fn new(
    rule: RuleId,
    root: PathBuf,
    graph: Arc<TargetGraph>,
    cache: Arc<Cache>,
    deps: Arc<dyn DependencyState>,
  ) -> Self {
    let dir = graph.rule(rule).dir.clone();
    Self {
      rule,
      dir,
      root,
      graph,
      cache,
      deps,
      fingerprint: Fingerprint::new(),
      inputs: Vec::new(),
      seen: HashSet::new(),
      failure: None,
    }
  }

  pub fn record(&mut self, call: serde_json::Value) {
    self.fingerprint.record(&call);
  }

  /// Fingerprint so far.
  pub fn key(&self) -> String {
    self.fingerprint.snapshot()
  }

  /// Every dependency and input path observed so far, in first-use order.
  pub fn inputs(&self) -> &[String] {
    &self.inputs
  }

  fn note_inputs(&mut self, paths: &[String]) {
    for path in paths {
      if self.seen.insert(path.clone()) {
        self.inputs.push(path.clone());
      }
    }
  }

  /// Fail with [`ContextError::Missing`] unless every producer is ready.
  fn ensure_ready(&self, paths: &[String]) -> Result<(), ContextError> {
    let mut unready = Vec::new();
    for path in paths {
      let producer = self
        .graph
        .lookup(path)
        .map_err(|_| ContextError::UnknownInput(path.clone()))?;
      if let Some(id) = producer
        && id != self.rule
        && !self.deps.is_ready(id)
      {
        unready.push(path.clone());
      }
    }
    if unready.is_empty() {
      Ok(())
    } else {
      Err(ContextError::Missing(unready))
    }
  }

  /// Mix what `path` currently holds into the fingerprint.
  fn mix_content(&mut self, path: &str) -> Result<(), ContextError> {
    if is_rule_ref(path) {
      let id = self
        .graph
        .lookup_name(path)
        .ok_or_else(|| ContextError::UnknownInput(path.to_string()))?;
      let value = self.deps.value(id).unwrap_or_default();
      self.fingerprint.record(&json!(["value", path, value.to_json()]));
      let outputs = self.graph.rule(id).outputs.clone();
      for output in outputs {
        self.fingerprint.update(output.as_bytes());
        self.fingerprint.update_path(&self.root.join(&output))?;
      }
    } else {
      self.fingerprint.update_path(&self.root.join(path))?;
    }
    Ok(())
  }

  /// Keep the first error raised into the interpreter. Rule code may catch
  /// errors with `pcall`, so the scheduler reads this instead.
  pub fn fail(&mut self, err: ContextError) {
    if self.failure.is_none() {
      self.failure = Some(err);
    }
  }

  pub fn failed(&self) -> bool {
    self.failure.is_some()
  }

  pub fn take_failure(&mut self) -> Option<ContextError> {
    self.failure.take()
  }

  /// Working directory for the rule's commands.
  pub fn cwd(&self) -> PathBuf {
    self.root.join(&self.dir)
  }
}

/// The primitives available to rule implementations.
///
/// Variants supply the effects (`flush`, `run_sh`, `resolve_sh_input`); the
/// recording discipline is shared.
pub trait ExecutionContext {
  fn base(&self) -> &ContextBase;

  fn base_mut(&mut self) -> &mut ContextBase;

  /// Run any queued commands.
  fn flush(&mut self) -> Result<(), ContextError>;

  fn run_sh(&mut self, cmd: &str, env: &Env) -> Result<(), ContextError>;

  /// Produce the output of a shell input whose memo slot is `(scope, token)`.
  fn resolve_sh_input(&mut self, scope: &str, token: &str, cmd: &str, env: &Env) -> Result<String, ContextError>;

  /// Declare dependencies. Returns them in the order given.
  fn add_deps(&mut self, paths: Vec<String>) -> Result<Vec<String>, ContextError> {
    self.base_mut().record(json!(["add_deps", paths]));
    self.base_mut().note_inputs(&paths);
    self.flush()?;
    self.base().ensure_ready(&paths)?;
    for path in &paths {
      self.base_mut().mix_content(path)?;
    }
    Ok(paths)
  }

  fn sh(&mut self, cmd: &str, env: &Env) -> Result<(), ContextError> {
    self.base_mut().record(json!(["sh", cmd, env]));
    self.run_sh(cmd, env)
  }

  /// Read a file as an input.
  fn input_file(&mut self, path: &str) -> Result<String, ContextError> {
    let paths = vec![path.to_string()];
    self.base_mut().record(json!(["input", path]));
    self.base_mut().note_inputs(&paths);
    self.flush()?;
    self.base().ensure_ready(&paths)?;

    let full = self.base().root.join(path);
    let bytes = fs::read(&full).map_err(|source| ContextError::Read { path: full, source })?;
    self.base_mut().fingerprint.update(&bytes);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
  }

  /// Use a command's standard output as an input.
  fn input_sh(&mut self, cmd: &str, env: &Env) -> Result<String, ContextError> {
    self.base_mut().record(json!(["input_sh", cmd, env]));
    self.flush()?;
    let scope = self.base().key();
    let token = hash_bytes(json!([cmd, env]).to_string().as_bytes()).0;
    let output = self.resolve_sh_input(&scope, &token, cmd, env)?;
    self.base_mut().fingerprint.update(output.as_bytes());
    Ok(output)
  }

  /// Value produced by a named dependency, declaring it as a dependency.
  fn value(&mut self, name: &str) -> Result<Value, ContextError> {
    self.add_deps(vec![name.to_string()])?;
    let base = self.base();
    let id = base
      .graph
      .lookup_name(name)
      .ok_or_else(|| ContextError::UnknownInput(name.to_string()))?;
    Ok(base.deps.value(id).unwrap_or_default())
  }
}
