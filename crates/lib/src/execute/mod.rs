//! Build execution.
//!
//! This module provides the main entry point for building a target. It
//! handles:
//! - opening the configured cache
//! - bringing the workspace setup rule up to date
//! - draining the rule queue on a pool of worker threads
//!
//! Per rule, a worker previews the implementation to compute its cache key
//! without side effects. A known key is looked up in the cache; a miss runs
//! the rule once in a sandbox holding exactly its observed inputs. When the
//! preview cannot know every input (a shell input it has never seen), the
//! rule runs live to discover them and is then verified in a sandbox. A
//! rule needing something not yet built is parked until the producer
//! finishes.

mod bootstrap;
mod state;
pub mod types;
mod worker;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Instant;

use tracing::{debug, info};

use crate::cache::Cache;
use crate::consts::{MIRROR_SUBDIR, STATE_DIR};
use crate::graph::RuleId;
use crate::value::Value;
use crate::workspace::Workspace;

use state::BuildState;
use worker::Worker;

pub use bootstrap::{SetupOutcome, run_setup};
pub use types::{BuildError, BuildOptions, BuildReport, CacheLocation, Outcome, RuleTiming, num_cpus};

/// Build `target` and everything it depends on.
///
/// # Arguments
///
/// * `workspace` - The loaded workspace
/// * `target` - The rule to build
/// * `options` - Threads, cache location, profiling
///
/// # Returns
///
/// A `BuildReport` with per-invocation counters, or the first error any
/// worker hit.
pub fn build(workspace: &Workspace, target: RuleId, options: &BuildOptions) -> Result<BuildReport, BuildError> {
  let started = Instant::now();
  let cache = Arc::new(open_cache(&workspace.root, &options.cache)?);
  let mut report = BuildReport {
    target: workspace.graph.rule(target).label(),
    ..Default::default()
  };

  let ready = match &workspace.config.default_setup_rule {
    Some(setup) => {
      let setup = workspace.lookup("", setup)?;
      let outcome = run_setup(workspace, setup, &cache)?;
      report.setup_runs = outcome.ran;
      report.setup_skipped = outcome.skipped;
      if options.profile {
        report.timings.extend(outcome.timings);
      }
      outcome.ready
    }
    None => HashMap::new(),
  };

  schedule(workspace, target, &cache, ready, options, &mut report)?;

  report.cache = cache.stats();
  report.elapsed = started.elapsed();
  report.timings.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
  info!(
    target = %report.target,
    built = report.executed(),
    cache_hits = report.cache_hits,
    elapsed_ms = report.elapsed.as_millis() as u64,
    "build complete"
  );
  Ok(report)
}

/// Open the cache described by `location` for the workspace at `root`.
pub fn open_cache(root: &Path, location: &CacheLocation) -> Result<Cache, BuildError> {
  let cache = match location {
    CacheLocation::Remote(url) => Cache::remote(url, root.join(STATE_DIR).join(MIRROR_SUBDIR))?,
    local => {
      let dir = local.local_dir(root).unwrap_or_else(|| root.join(STATE_DIR));
      debug!(dir = %dir.display(), "using local cache");
      Cache::local(dir)
    }
  };
  Ok(cache)
}

/// Run the worker pool until `target` is ready or the build fails.
fn schedule(
  workspace: &Workspace,
  target: RuleId,
  cache: &Arc<Cache>,
  ready: HashMap<RuleId, Value>,
  options: &BuildOptions,
  report: &mut BuildReport,
) -> Result<(), BuildError> {
  let threads = options.threads.max(1);
  let (tx, rx) = mpsc::channel();
  let state = Arc::new(BuildState::new(workspace.graph.clone(), target, threads, tx, ready));
  let jobs = Mutex::new(rx);
  let signature = workspace.graph.signature();

  info!(target = %report.target, threads, rules = workspace.graph.len(), "starting build");
  state.start();

  thread::scope(|scope| {
    for n in 0..threads {
      let worker_state = state.clone();
      let graph = workspace.graph.clone();
      let cache = cache.clone();
      let (root, jobs, signature) = (workspace.root.as_path(), &jobs, signature.as_str());
      let flags = &options.flags;
      let profile = options.profile;
      let spawned = thread::Builder::new()
        .name(format!("rivet-worker-{n}"))
        .spawn_scoped(scope, move || {
          match Worker::new(root, flags, graph, cache, worker_state.clone(), signature, profile) {
            Ok(worker) => worker.run(jobs),
            Err(e) => worker_state.fail(e),
          }
        });
      if let Err(source) = spawned {
        state.fail(BuildError::Io {
          path: workspace.root.clone(),
          source,
        });
        break;
      }
    }
  });

  if let Some(err) = state.take_failure() {
    return Err(err);
  }

  for (id, key) in state.take_keys() {
    report.keys.insert(workspace.graph.rule(id).label(), key);
  }
  report.timings.extend(state.take_timings());
  let counters = &state.counters;
  report.previews = counters.previews.load(Ordering::Relaxed);
  report.cache_hits = counters.cache_hits.load(Ordering::Relaxed);
  report.sandboxed_runs = counters.sandboxed_runs.load(Ordering::Relaxed);
  report.discovery_runs = counters.discovery_runs.load(Ordering::Relaxed);
  Ok(())
}
