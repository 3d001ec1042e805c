//! Implementation of `rivet --locate TARGET`.

use anyhow::Result;

use rivet_lib::lua::Flags;
use rivet_lib::workspace::Workspace;

use crate::output::{print_info, print_stat, symbols};

/// Print the rule producing `target`, where it is declared and what it
/// outputs, without building anything.
pub fn cmd_locate(target: Option<&str>, flags: &Flags) -> Result<()> {
  let cwd = std::env::current_dir()?;
  let workspace = Workspace::open(&cwd, flags)?;
  let id = workspace.resolve_target(target)?;
  let rule = workspace.graph.rule(id);

  print_info(&rule.label());
  print_stat("Declared in", &rule.build_file);
  print_stat("Directory", if rule.dir.is_empty() { "//" } else { &rule.dir });
  println!("  Outputs:");
  for output in &rule.outputs {
    println!("    {} {}", symbols::ARROW, output);
  }
  Ok(())
}
