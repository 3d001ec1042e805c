use crate::depset::DepSet;

/// Index of a rule in its [`TargetGraph`](super::TargetGraph).
///
/// Rules are numbered in registration order, which is deterministic for a
/// given tree, so the same id names the same rule in every interpreter that
/// evaluated the same build files.
pub type RuleId = usize;

/// One build target.
///
/// Everything here is fixed at load time. Runtime bookkeeping (readiness,
/// dependents, produced values) lives in the scheduler's state.
#[derive(Debug, Clone)]
pub struct Rule {
  pub id: RuleId,
  pub name: Option<String>,
  /// Directory of the declaring build file (or of the macro caller).
  pub dir: String,
  /// Build file that registered the rule, for diagnostics.
  pub build_file: String,
  /// Statically declared dependencies, already resolved.
  pub deps: DepSet,
  /// Declared outputs; a trailing `/` marks a directory output.
  pub outputs: Vec<String>,
  /// Copy outputs out of the cache instead of symlinking them.
  pub do_not_symlink: bool,
}

impl Rule {
  /// Human-readable identifier: `:name` for named rules, otherwise the
  /// first output.
  pub fn label(&self) -> String {
    match &self.name {
      Some(name) => format!(":{name}"),
      None => self.outputs.first().cloned().unwrap_or_else(|| format!("#{}", self.id)),
    }
  }
}

/// A rule as declared, before the graph assigns it an id.
#[derive(Debug, Clone)]
pub struct RuleDecl {
  pub name: Option<String>,
  pub dir: String,
  pub build_file: String,
  pub deps: DepSet,
  pub outputs: Vec<String>,
  pub do_not_symlink: bool,
}
