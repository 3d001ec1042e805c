//! Setup rules: run once against the live tree before the build proper.
//!
//! A single thread walks the setup rule's dependencies with an explicit
//! stack. Each completed rule leaves a record of its cache key and output
//! hashes under `.rivet/setup/`, and is skipped on later invocations while
//! both still match.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::types::{BuildError, Outcome, RuleTiming};
use crate::cache::{Cache, CacheError};
use crate::consts::{SETUP_SUBDIR, STATE_DIR};
use crate::context::{ContextBase, ContextError, DependencyState, PreviewContext, WorkspaceContext};
use crate::graph::{Rule, RuleId};
use crate::lua::run_rule;
use crate::util::hash::{hash_bytes, hash_path};
use crate::value::Value;
use crate::workspace::Workspace;

/// Persisted result of a setup rule.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct SetupRecord {
  rule: String,
  key: String,
  /// Content hash of every output, by output path.
  outputs: BTreeMap<String, String>,
}

/// Setup rules completed so far, in this invocation.
#[derive(Default)]
struct SetupState {
  values: Mutex<HashMap<RuleId, Value>>,
}

impl SetupState {
  fn mark(&self, id: RuleId, value: Value) {
    self.values.lock().unwrap_or_else(PoisonError::into_inner).insert(id, value);
  }

  fn take(&self) -> HashMap<RuleId, Value> {
    std::mem::take(&mut *self.values.lock().unwrap_or_else(PoisonError::into_inner))
  }
}

impl DependencyState for SetupState {
  fn is_ready(&self, id: RuleId) -> bool {
    self.values.lock().unwrap_or_else(PoisonError::into_inner).contains_key(&id)
  }

  fn value(&self, id: RuleId) -> Option<Value> {
    self.values.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
  }
}

#[derive(Debug, Default)]
pub struct SetupOutcome {
  /// Every rule completed or confirmed, with its value.
  pub ready: HashMap<RuleId, Value>,
  pub ran: usize,
  pub skipped: usize,
  pub timings: Vec<RuleTiming>,
}

/// Bring `target` and everything it depends on up to date.
pub fn run_setup(workspace: &Workspace, target: RuleId, cache: &Arc<Cache>) -> Result<SetupOutcome, BuildError> {
  let records = workspace.root.join(STATE_DIR).join(SETUP_SUBDIR);
  let state = Arc::new(SetupState::default());
  let mut outcome = SetupOutcome::default();
  let mut pending = Pending::new(target);

  while let Some(id) = pending.top() {
    if state.is_ready(id) {
      pending.finish(id);
      continue;
    }
    let rule = workspace.graph.rule(id);
    let label = rule.label();
    let record_path = records.join(format!("{}.json", hash_bytes(label.as_bytes())));
    let started = Instant::now();
    let base = || {
      ContextBase::new(
        id,
        workspace.root.clone(),
        workspace.graph.clone(),
        cache.clone(),
        state.clone(),
      )
    };

    match run_rule(&workspace.loader, rule, PreviewContext::new(base())) {
      Ok(preview) => {
        if is_current(&record_path, &preview.key, rule, &workspace.root) {
          info!(rule = %label, "setup rule unchanged");
          state.mark(id, preview.value);
          pending.finish(id);
          outcome.skipped += 1;
          outcome.timings.push(RuleTiming {
            rule: label,
            outcome: Outcome::SetupSkipped,
            elapsed: started.elapsed(),
          });
          continue;
        }
      }
      Err(ContextError::Missing(paths)) => {
        pending.wait_on(workspace, id, &paths)?;
        continue;
      }
      Err(ContextError::Unknowable { .. }) => {}
      Err(e) => return Err(BuildError::rule(label, e)),
    }

    info!(rule = %label, "running setup rule");
    match run_rule(&workspace.loader, rule, WorkspaceContext::new(base())) {
      Ok(run) => {
        write_record(&record_path, &label, &run.key, rule, &workspace.root)?;
        state.mark(id, run.value);
        pending.finish(id);
        outcome.ran += 1;
        outcome.timings.push(RuleTiming {
          rule: label,
          outcome: Outcome::Setup,
          elapsed: started.elapsed(),
        });
      }
      Err(ContextError::Missing(paths)) => pending.wait_on(workspace, id, &paths)?,
      Err(e) => return Err(BuildError::rule(label, e)),
    }
  }

  outcome.ready = state.take();
  Ok(outcome)
}

/// Setup rules still to bring up to date, innermost dependency on top.
struct Pending {
  stack: Vec<RuleId>,
  /// Producers each unfinished rule last reported missing.
  waiting_on: HashMap<RuleId, Vec<RuleId>>,
}

impl Pending {
  fn new(target: RuleId) -> Self {
    Self {
      stack: vec![target],
      waiting_on: HashMap::new(),
    }
  }

  fn top(&self) -> Option<RuleId> {
    self.stack.last().copied()
  }

  fn finish(&mut self, id: RuleId) {
    self.stack.retain(|&other| other != id);
    self.waiting_on.remove(&id);
  }

  /// Queue the producers of `paths` ahead of `id`.
  ///
  /// A producer that is already queued moves to the top. Only a producer
  /// that itself waits on `id` is a cycle.
  fn wait_on(&mut self, workspace: &Workspace, id: RuleId, paths: &[String]) -> Result<(), BuildError> {
    let mut producers = Vec::new();
    for path in paths {
      match workspace.graph.lookup(path) {
        Ok(Some(producer)) if !producers.contains(&producer) => producers.push(producer),
        Ok(_) => {}
        Err(e) => return Err(BuildError::Internal(format!("setup lost track of a dependency: {e}"))),
      }
    }
    for &producer in &producers {
      let mut chain = Vec::new();
      if self.reaches(producer, id, &mut HashSet::new(), &mut chain) {
        return Err(BuildError::Cycle(
          chain.iter().map(|&rule| workspace.graph.rule(rule).label()).collect(),
        ));
      }
    }
    for &producer in &producers {
      debug!(rule = %workspace.graph.rule(producer).label(), "setup dependency");
      self.stack.retain(|&other| other != producer);
      self.stack.push(producer);
    }
    self.waiting_on.insert(id, producers);
    Ok(())
  }

  /// Whether `from` waits on `to`, directly or transitively; `chain` then
  /// holds the rules along the way.
  fn reaches(&self, from: RuleId, to: RuleId, visited: &mut HashSet<RuleId>, chain: &mut Vec<RuleId>) -> bool {
    chain.push(from);
    if from == to {
      return true;
    }
    if visited.insert(from) {
      for &next in self.waiting_on.get(&from).map(Vec::as_slice).unwrap_or_default() {
        if self.reaches(next, to, visited, chain) {
          return true;
        }
      }
    }
    chain.pop();
    false
  }
}

/// Whether the stored record matches `key` and the outputs on disk.
fn is_current(record_path: &Path, key: &str, rule: &Rule, root: &Path) -> bool {
  let Ok(bytes) = fs::read(record_path) else {
    return false;
  };
  let record: SetupRecord = match serde_json::from_slice(&bytes) {
    Ok(record) => record,
    Err(e) => {
      warn!(path = %record_path.display(), error = %e, "ignoring unreadable setup record");
      return false;
    }
  };
  if record.key != key {
    return false;
  }
  match output_hashes(rule, root) {
    Ok(hashes) => hashes == record.outputs,
    Err(_) => false,
  }
}

fn write_record(path: &Path, label: &str, key: &str, rule: &Rule, root: &Path) -> Result<(), BuildError> {
  let record = SetupRecord {
    rule: label.to_string(),
    key: key.to_string(),
    outputs: output_hashes(rule, root).map_err(|e| BuildError::rule(label.to_string(), e))?,
  };
  let failed = |message: String| BuildError::SetupRecord {
    rule: label.to_string(),
    message,
  };
  let json = serde_json::to_vec_pretty(&record).map_err(|e| failed(e.to_string()))?;
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
  }
  fs::write(path, json).map_err(|e| failed(e.to_string()))
}

fn output_hashes(rule: &Rule, root: &Path) -> Result<BTreeMap<String, String>, ContextError> {
  let mut hashes = BTreeMap::new();
  for output in &rule.outputs {
    let path = root.join(output.trim_end_matches('/'));
    if !path.exists() {
      return Err(ContextError::Cache(CacheError::MissingOutput { output: output.clone() }));
    }
    hashes.insert(output.clone(), hash_path(&path)?.0);
  }
  Ok(hashes)
}
