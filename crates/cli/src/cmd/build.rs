//! Implementation of the default `rivet [TARGET]` command.

use anyhow::Result;
use tracing::debug;

use rivet_lib::execute::{self, BuildOptions, BuildReport, CacheLocation};
use rivet_lib::lua::Flags;
use rivet_lib::workspace::Workspace;

use crate::output::{format_duration, print_stat, print_success, print_timings};

/// Command line settings for a build.
pub struct BuildArgs {
  pub threads: Option<usize>,
  pub cache: Option<CacheLocation>,
  pub flags: Flags,
  pub profile: bool,
}

/// Build `target` from the workspace enclosing the current directory and
/// print a summary.
pub fn cmd_build(target: Option<&str>, args: BuildArgs) -> Result<()> {
  let cwd = std::env::current_dir()?;
  let workspace = Workspace::open(&cwd, &args.flags)?;
  let target = workspace.resolve_target(target)?;
  debug!(root = %workspace.root.display(), target = %workspace.graph.rule(target).label(), "resolved target");

  let mut options = BuildOptions {
    flags: args.flags,
    profile: args.profile,
    ..Default::default()
  };
  if let Some(threads) = args.threads {
    options.threads = threads;
  }
  if let Some(cache) = args.cache {
    options.cache = cache;
  }

  let report = execute::build(&workspace, target, &options)?;
  print_report(&report, args.profile);
  Ok(())
}

fn print_report(report: &BuildReport, profile: bool) {
  print_success(&format!("Built {} in {}", report.target, format_duration(report.elapsed)));
  print_stat(
    "Rules",
    &format!(
      "{} ({} cached, {} executed)",
      report.keys.len(),
      report.cache_hits,
      report.executed()
    ),
  );
  print_stat("Discovery runs", &report.discovery_runs.to_string());
  print_stat("Sandboxed runs", &report.sandboxed_runs.to_string());
  if report.setup_runs + report.setup_skipped > 0 {
    print_stat(
      "Setup rules",
      &format!("{} run, {} unchanged", report.setup_runs, report.setup_skipped),
    );
  }

  if profile && !report.timings.is_empty() {
    print_timings(&report.timings);
  }
}
