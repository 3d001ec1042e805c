//! Shared state of one build invocation.
//!
//! All scheduling transitions (enqueue, wait, complete) happen under a
//! single mutex. Completing a rule and fanning out to its dependents is one
//! critical section, so a worker registering itself as a dependent of a rule
//! either sees it ready or is guaranteed to be woken by it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};

use tracing::{debug, error};

use super::types::{BuildError, RuleTiming};
use crate::context::DependencyState;
use crate::graph::{RuleId, TargetGraph};
use crate::value::Value;

/// Work queue message; `None` retires one worker.
pub(super) type Job = Option<RuleId>;

#[derive(Default)]
struct Scheduling {
  /// Ready rules and the values they produced.
  values: HashMap<RuleId, Value>,
  /// Queued, running or waiting, but not ready.
  scheduled: HashSet<RuleId>,
  /// Blocked rules and how many producers each still waits for.
  waiting: HashMap<RuleId, usize>,
  /// Rules to wake when a producer completes.
  dependents: HashMap<RuleId, Vec<RuleId>>,
  /// Jobs queued or being processed.
  outstanding: usize,
  finished: bool,
}

#[derive(Debug, Default)]
pub(super) struct Counters {
  pub previews: AtomicUsize,
  pub cache_hits: AtomicUsize,
  pub sandboxed_runs: AtomicUsize,
  pub discovery_runs: AtomicUsize,
}

impl Counters {
  pub fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }
}

pub(super) struct BuildState {
  graph: Arc<TargetGraph>,
  target: RuleId,
  workers: usize,
  queue: mpsc::Sender<Job>,
  sched: Mutex<Scheduling>,
  failure: Mutex<Option<BuildError>>,
  failed: AtomicBool,
  keys: Mutex<Vec<(RuleId, String)>>,
  timings: Mutex<Vec<RuleTiming>>,
  pub counters: Counters,
}

impl BuildState {
  /// `ready` holds rules completed before the build started.
  pub fn new(
    graph: Arc<TargetGraph>,
    target: RuleId,
    workers: usize,
    queue: mpsc::Sender<Job>,
    ready: HashMap<RuleId, Value>,
  ) -> Self {
    Self {
      graph,
      target,
      workers,
      queue,
      sched: Mutex::new(Scheduling {
        values: ready,
        ..Default::default()
      }),
      failure: Mutex::new(None),
      failed: AtomicBool::new(false),
      keys: Mutex::new(Vec::new()),
      timings: Mutex::new(Vec::new()),
      counters: Counters::default(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Scheduling> {
    self.sched.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Queue the target, or finish at once if it is already ready.
  pub fn start(&self) {
    let mut sched = self.lock();
    if sched.values.contains_key(&self.target) {
      self.finish(&mut sched);
    } else {
      sched.scheduled.insert(self.target);
      self.enqueue(&mut sched, self.target);
    }
  }

  fn enqueue(&self, sched: &mut Scheduling, id: RuleId) {
    if sched.finished {
      return;
    }
    sched.outstanding += 1;
    // The receiver outlives every worker, so sending cannot fail mid-build.
    let _ = self.queue.send(Some(id));
  }

  /// Retire every worker once.
  fn finish(&self, sched: &mut Scheduling) {
    if sched.finished {
      return;
    }
    sched.finished = true;
    for _ in 0..self.workers {
      let _ = self.queue.send(None);
    }
  }

  /// Park `id` until every rule in `producers` is ready, scheduling the
  /// producers that are not yet known to the build.
  ///
  /// If all of them became ready in the meantime nothing would ever wake
  /// `id`, so it is queued again directly.
  pub fn wait_on(&self, id: RuleId, producers: &[RuleId]) {
    let mut sched = self.lock();
    let mut pending = 0;
    let mut seen = HashSet::new();
    for &producer in producers {
      if !seen.insert(producer) || producer == id || sched.values.contains_key(&producer) {
        continue;
      }
      pending += 1;
      sched.dependents.entry(producer).or_default().push(id);
      if sched.scheduled.insert(producer) {
        debug!(rule = %self.graph.rule(producer).label(), "scheduling producer");
        self.enqueue(&mut sched, producer);
      }
    }
    sched.scheduled.insert(id);
    if pending == 0 {
      debug!(rule = %self.graph.rule(id).label(), "dependencies became ready, requeueing");
      self.enqueue(&mut sched, id);
    } else {
      sched.waiting.insert(id, pending);
    }
    self.job_done(&mut sched);
  }

  /// Mark `id` ready and queue every dependent no longer waiting on
  /// anything.
  pub fn mark_done(&self, id: RuleId, value: Value, key: String) {
    self.lock_keys().push((id, key));
    let mut sched = self.lock();
    sched.values.insert(id, value);
    sched.scheduled.remove(&id);
    for dependent in sched.dependents.remove(&id).unwrap_or_default() {
      let Some(count) = sched.waiting.get_mut(&dependent) else {
        continue;
      };
      *count -= 1;
      if *count == 0 {
        sched.waiting.remove(&dependent);
        self.enqueue(&mut sched, dependent);
      }
    }
    if sched.values.contains_key(&self.target) {
      self.finish(&mut sched);
    }
    self.job_done(&mut sched);
  }

  /// Account for a finished job; with nothing queued or running and the
  /// target not ready, the waiting rules form a cycle.
  fn job_done(&self, sched: &mut Scheduling) {
    sched.outstanding = sched.outstanding.saturating_sub(1);
    if sched.outstanding > 0 || sched.finished || sched.values.contains_key(&self.target) {
      return;
    }
    let mut blocked: Vec<String> = sched.waiting.keys().map(|&id| self.graph.rule(id).label()).collect();
    blocked.sort();
    self.set_failure(BuildError::Cycle(blocked));
    self.finish(sched);
  }

  /// Record the first failure and stop the build.
  pub fn fail(&self, err: BuildError) {
    self.set_failure(err);
    let mut sched = self.lock();
    self.finish(&mut sched);
  }

  fn set_failure(&self, err: BuildError) {
    let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
      error!(error = %err, "build failed");
      *slot = Some(err);
      self.failed.store(true, Ordering::SeqCst);
    }
  }

  pub fn has_failed(&self) -> bool {
    self.failed.load(Ordering::SeqCst)
  }

  pub fn take_failure(&self) -> Option<BuildError> {
    self.failure.lock().unwrap_or_else(PoisonError::into_inner).take()
  }

  pub fn record_timing(&self, timing: RuleTiming) {
    self.timings.lock().unwrap_or_else(PoisonError::into_inner).push(timing);
  }

  pub fn take_timings(&self) -> Vec<RuleTiming> {
    std::mem::take(&mut *self.timings.lock().unwrap_or_else(PoisonError::into_inner))
  }

  fn lock_keys(&self) -> MutexGuard<'_, Vec<(RuleId, String)>> {
    self.keys.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn take_keys(&self) -> Vec<(RuleId, String)> {
    std::mem::take(&mut *self.lock_keys())
  }
}

impl DependencyState for BuildState {
  fn is_ready(&self, id: RuleId) -> bool {
    self.lock().values.contains_key(&id)
  }

  fn value(&self, id: RuleId) -> Option<Value> {
    self.lock().values.get(&id).cloned()
  }
}
