//! One build thread: its own interpreter, draining the shared queue.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Instant;

use tracing::{debug, info};

use super::state::{BuildState, Counters, Job};
use super::types::{BuildError, Outcome, RuleTiming};
use crate::cache::{Cache, CacheError};
use crate::context::{ContextBase, ContextError, ExecuteContext, PreviewContext};
use crate::graph::{Rule, RuleId, TargetGraph};
use crate::lua::{Flags, Loader, RuleRun, run_rule};
use crate::sandbox::Sandbox;
use crate::util::fs::{copy_path, remove_path};
use crate::value::Value;

/// What processing a rule amounted to.
enum Step {
  Done { value: Value, key: String, outcome: Outcome },
  /// Waiting on these producers.
  Blocked(Vec<RuleId>),
}

/// What a single run of an implementation yielded.
enum Run {
  Finished(RuleRun),
  Blocked(Vec<RuleId>),
}

pub(super) struct Worker<'a> {
  root: &'a Path,
  loader: Loader,
  graph: Arc<TargetGraph>,
  cache: Arc<Cache>,
  state: Arc<BuildState>,
  profile: bool,
}

impl<'a> Worker<'a> {
  /// Evaluate the build files into a fresh interpreter and check that it
  /// numbers rules exactly like the shared graph.
  pub fn new(
    root: &'a Path,
    flags: &Flags,
    graph: Arc<TargetGraph>,
    cache: Arc<Cache>,
    state: Arc<BuildState>,
    signature: &str,
    profile: bool,
  ) -> Result<Self, BuildError> {
    let loaded = Loader::load(root, graph.sources().clone(), flags)?;
    if loaded.graph.signature() != signature {
      return Err(BuildError::Internal(
        "build files produced a different rule graph on a worker thread".to_string(),
      ));
    }
    Ok(Self {
      root,
      loader: loaded.loader,
      graph,
      cache,
      state,
      profile,
    })
  }

  /// Process jobs until retired. After a failure, queued jobs are
  /// discarded.
  pub fn run(self, jobs: &Mutex<mpsc::Receiver<Job>>) {
    loop {
      let job = {
        let rx = jobs.lock().unwrap_or_else(PoisonError::into_inner);
        rx.recv()
      };
      let Ok(Some(id)) = job else {
        break;
      };
      if self.state.has_failed() {
        continue;
      }
      self.process(id);
    }
  }

  fn process(&self, id: RuleId) {
    let rule = self.graph.rule(id);
    let started = Instant::now();
    match self.build(rule) {
      Ok(Step::Done { value, key, outcome }) => {
        info!(rule = %rule.label(), %outcome, "rule ready");
        if self.profile {
          self.state.record_timing(RuleTiming {
            rule: rule.label(),
            outcome,
            elapsed: started.elapsed(),
          });
        }
        self.state.mark_done(id, value, key);
      }
      Ok(Step::Blocked(producers)) => {
        debug!(rule = %rule.label(), producers = producers.len(), "waiting on dependencies");
        self.state.wait_on(id, &producers);
      }
      Err(e) => self.state.fail(e),
    }
  }

  fn build(&self, rule: &Rule) -> Result<Step, BuildError> {
    Counters::bump(&self.state.counters.previews);
    let preview = match run_rule(&self.loader, rule, PreviewContext::new(self.base(rule, self.root))) {
      Ok(run) => run,
      Err(ContextError::Missing(paths)) => return Ok(Step::Blocked(self.producers(&paths)?)),
      Err(ContextError::Unknowable { command }) => {
        debug!(rule = %rule.label(), %command, "dependencies unknown until the rule runs");
        return self.discover(rule);
      }
      Err(e) => return Err(BuildError::rule(rule.label(), e)),
    };

    if self.cache.load(&preview.key, rule, self.root)? {
      Counters::bump(&self.state.counters.cache_hits);
      return Ok(Step::Done {
        value: preview.value,
        key: preview.key,
        outcome: Outcome::CacheHit,
      });
    }

    let (verified, sandbox) = match self.sandboxed(rule, &preview.inputs)? {
      (Run::Finished(run), sandbox) => (run, sandbox),
      (Run::Blocked(producers), _) => return Ok(Step::Blocked(producers)),
    };
    if verified.key != preview.key {
      return Err(BuildError::Internal(format!(
        "cache key of {} changed between dependency discovery and the sandboxed run ({} != {})",
        rule.label(),
        preview.key,
        verified.key
      )));
    }
    self.publish(rule, &verified.key, &sandbox)?;
    Ok(Step::Done {
      value: verified.value,
      key: verified.key,
      outcome: Outcome::Sandboxed,
    })
  }

  /// Run `rule` against the live tree to learn what it reads, then verify
  /// the discovered set in a sandbox.
  fn discover(&self, rule: &Rule) -> Result<Step, BuildError> {
    self.clear_outputs(rule)?;
    Counters::bump(&self.state.counters.discovery_runs);
    info!(rule = %rule.label(), "running to discover dependencies");
    let live = run_rule(&self.loader, rule, ExecuteContext::new(self.base(rule, self.root), false));
    let live = match self.settle(rule, live)? {
      Run::Finished(run) => run,
      Run::Blocked(producers) => return Ok(Step::Blocked(producers)),
    };

    Counters::bump(&self.state.counters.previews);
    let preview = match run_rule(&self.loader, rule, PreviewContext::new(self.base(rule, self.root))) {
      Ok(run) => run,
      Err(ContextError::Missing(paths)) => return Ok(Step::Blocked(self.producers(&paths)?)),
      Err(e) if e.is_signal() => {
        return Err(BuildError::Internal(format!(
          "dependencies of {} are still unknown after running it: {e}",
          rule.label()
        )));
      }
      Err(e) => return Err(BuildError::rule(rule.label(), e)),
    };
    if preview.key != live.key {
      return Err(BuildError::Internal(format!(
        "cache key of {} differs between its discovery run and the following preview ({} != {})",
        rule.label(),
        live.key,
        preview.key
      )));
    }

    let (verified, sandbox) = match self.sandboxed(rule, &preview.inputs)? {
      (Run::Finished(run), sandbox) => (run, sandbox),
      (Run::Blocked(producers), _) => return Ok(Step::Blocked(producers)),
    };
    if verified.key != live.key {
      return Err(BuildError::Internal(format!(
        "cache key of {} differs between the discovery run and the sandboxed run ({} != {}); \
         the rule may not be deterministic",
        rule.label(),
        live.key,
        verified.key
      )));
    }
    self.publish(rule, &verified.key, &sandbox)?;
    Ok(Step::Done {
      value: verified.value,
      key: verified.key,
      outcome: Outcome::Discovered,
    })
  }

  /// Run `rule` in a sandbox holding exactly `inputs`.
  fn sandboxed(&self, rule: &Rule, inputs: &[String]) -> Result<(Run, Sandbox), BuildError> {
    let sandbox = Sandbox::seed(self.root, &self.graph, rule, inputs)?;
    Counters::bump(&self.state.counters.sandboxed_runs);
    debug!(rule = %rule.label(), sandbox = %sandbox.path().display(), "running sandboxed");
    let context = ExecuteContext::new(self.base(rule, sandbox.path()), true);
    let run = self.settle(rule, run_rule(&self.loader, rule, context))?;
    Ok((run, sandbox))
  }

  /// Cache the outputs a sandboxed run produced and materialise them in the
  /// live tree.
  fn publish(&self, rule: &Rule, key: &str, sandbox: &Sandbox) -> Result<(), BuildError> {
    self.cache.save(key, rule, sandbox.path()).map_err(|e| match e {
      CacheError::MissingOutput { .. } => BuildError::rule(rule.label(), ContextError::Cache(e)),
      e => BuildError::Cache(e),
    })?;
    if self.cache.restore(key, rule, self.root)? {
      return Ok(());
    }
    debug!(rule = %rule.label(), "fresh cache entry not readable, copying outputs directly");
    for output in &rule.outputs {
      let rel = output.trim_end_matches('/');
      let dest = self.root.join(rel);
      remove_path(&dest)
        .and_then(|()| copy_path(&sandbox.path().join(rel), &dest))
        .map_err(|source| BuildError::Io { path: dest, source })?;
    }
    Ok(())
  }

  fn clear_outputs(&self, rule: &Rule) -> Result<(), BuildError> {
    for output in &rule.outputs {
      let path = self.root.join(output.trim_end_matches('/'));
      remove_path(&path).map_err(|source| BuildError::Io { path, source })?;
    }
    Ok(())
  }

  fn settle(&self, rule: &Rule, result: Result<RuleRun, ContextError>) -> Result<Run, BuildError> {
    match result {
      Ok(run) => Ok(Run::Finished(run)),
      Err(ContextError::Missing(paths)) => Ok(Run::Blocked(self.producers(&paths)?)),
      Err(e) => Err(BuildError::rule(rule.label(), e)),
    }
  }

  /// The rules producing `paths`.
  fn producers(&self, paths: &[String]) -> Result<Vec<RuleId>, BuildError> {
    let mut producers = Vec::new();
    for path in paths {
      match self.graph.lookup(path) {
        Ok(Some(id)) => producers.push(id),
        Ok(None) => {}
        Err(e) => return Err(BuildError::Internal(format!("scheduler lost track of a dependency: {e}"))),
      }
    }
    Ok(producers)
  }

  fn base(&self, rule: &Rule, root: &Path) -> ContextBase {
    ContextBase::new(
      rule.id,
      PathBuf::from(root),
      self.graph.clone(),
      self.cache.clone(),
      self.state.clone(),
    )
  }
}
