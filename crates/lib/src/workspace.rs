//! Repository discovery and the loaded view of one workspace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::consts::WORKSPACE_FILE;
use crate::execute::BuildError;
use crate::graph::paths::resolve;
use crate::graph::{RuleId, SourceSet, TargetGraph};
use crate::lua::{Flags, Loader};

/// Settings registered through `rivet.config` in `WORKSPACE.lua`.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfig {
  /// Rule reference (`:name` or output path) built before anything else.
  pub default_setup_rule: Option<String>,
  /// Target used when none is given on the command line.
  pub default_build_rule: Option<String>,
  /// Repo-relative directories (trailing `/`) holding generated files.
  pub output_directories: Vec<String>,
  pub minimum_version: Option<String>,
}

/// Walk up from `start` to the nearest directory holding `WORKSPACE.lua`.
pub fn find_root(start: &Path) -> Option<PathBuf> {
  let start = dunce::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
  start
    .ancestors()
    .find(|dir| dir.join(WORKSPACE_FILE).is_file())
    .map(Path::to_path_buf)
}

/// A repository with its build files evaluated.
pub struct Workspace {
  pub root: PathBuf,
  /// Directory the tool was invoked from, relative to `root`.
  pub cwd: String,
  pub config: WorkspaceConfig,
  pub graph: Arc<TargetGraph>,
  pub loader: Loader,
}

impl Workspace {
  /// Locate the workspace enclosing `start` and load it.
  ///
  /// `WORKSPACE.lua` is read first on its own so that registered output
  /// directories are left out of source enumeration.
  pub fn open(start: &Path, flags: &Flags) -> Result<Self, BuildError> {
    let root = find_root(start).ok_or_else(|| BuildError::NoWorkspace(start.to_path_buf()))?;
    let cwd = relative_dir(&root, start);
    debug!(root = %root.display(), cwd = %cwd, "found workspace");

    let config = Loader::read_config(&root, flags)?;
    let sources = Arc::new(SourceSet::scan(&root, &config.output_directories)?);
    info!(sources = sources.files().count(), "enumerated sources");

    let loaded = Loader::load(&root, sources, flags)?;
    Ok(Self {
      root,
      cwd,
      config: loaded.config,
      graph: Arc::new(loaded.graph),
      loader: loaded.loader,
    })
  }

  /// Resolve a target as written on the command line, falling back to the
  /// registered default build rule.
  pub fn resolve_target(&self, target: Option<&str>) -> Result<RuleId, BuildError> {
    match target {
      Some(target) => self.lookup(&self.cwd, target),
      None => {
        let default = self.config.default_build_rule.as_deref().ok_or(BuildError::NoTarget)?;
        self.lookup("", default)
      }
    }
  }

  /// Resolve a rule reference written relative to `dir`.
  pub fn lookup(&self, dir: &str, target: &str) -> Result<RuleId, BuildError> {
    let unknown = || BuildError::UnknownTarget(target.to_string());
    let path = resolve(dir, target).map_err(|_| unknown())?;
    let mut candidates = vec![path.clone()];
    if !path.ends_with('/') && !path.starts_with(':') {
      candidates.push(format!("{path}/"));
    }
    candidates
      .iter()
      .find_map(|candidate| self.graph.lookup(candidate).ok().flatten())
      .ok_or_else(unknown)
  }
}

fn relative_dir(root: &Path, start: &Path) -> String {
  let start = dunce::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
  match start.strip_prefix(root) {
    Ok(rel) => rel
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/"),
    Err(_) => String::new(),
  }
}
