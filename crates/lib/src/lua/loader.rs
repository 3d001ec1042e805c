//! Evaluating `WORKSPACE.lua` and every `BUILD.lua` into a [`TargetGraph`].
//!
//! Each file runs in its own environment table. Reads fall back to the Lua
//! globals; writes stay in the file's environment, so files cannot leak
//! definitions into one another except through `rivet.import`. The
//! environment's `rivet` table holds the declaration primitives, bound to
//! the file's directory (see [`super::primitives`]).
//!
//! All loader state lives in one [`LoadState`] shared by the primitives of
//! a single interpreter. Nothing is global: two loaders over the same tree
//! are independent and produce identical graphs.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use mlua::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use super::primitives::create_rivet_table;
use crate::consts::{BUILD_FILE, WORKSPACE_FILE};
use crate::depset::DepSet;
use crate::graph::paths::parent_dir;
use crate::graph::{GraphError, RuleId, SourceSet, TargetGraph};
use crate::workspace::WorkspaceConfig;

/// `--flag key=value` pairs, visible to build files as `rivet.flags`.
pub type Flags = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("failed to evaluate {file}: {message}")]
  Eval { file: String, message: String },

  #[error("rule {rule} depends on {path}, which is neither a tracked source nor a declared output")]
  UnknownDependency { rule: String, path: String },

  #[error(transparent)]
  Graph(#[from] GraphError),
}

enum Import {
  InProgress,
  Done(LuaValue),
}

/// Mutable state of one loading pass.
pub(super) struct LoadState {
  pub root: PathBuf,
  pub sources: Arc<SourceSet>,
  pub flags: Flags,
  pub graph: TargetGraph,
  pub impls: Vec<LuaFunction>,
  imports: HashMap<String, Import>,
  /// Files currently being evaluated, outermost first.
  file_stack: Vec<String>,
  pub globs: HashMap<(String, String), DepSet>,
  /// Directories of the files that invoked the running macros.
  pub macro_dirs: Vec<String>,
  pub providers: usize,
  pub config: WorkspaceConfig,
  pub sealed: bool,
}

impl LoadState {
  pub fn current_file(&self) -> &str {
    self.file_stack.last().map(String::as_str).unwrap_or("")
  }

  /// Directory that relative paths resolve against: the macro caller's
  /// while a macro runs, otherwise the declaring file's.
  pub fn effective_dir(&self, file_dir: &str) -> String {
    self.macro_dirs.last().cloned().unwrap_or_else(|| file_dir.to_string())
  }
}

pub type SharedState = Rc<RefCell<LoadState>>;

/// One interpreter with the build files of a repository evaluated into it.
pub struct Loader {
  lua: Lua,
  state: SharedState,
}

/// Result of [`Loader::load`].
pub struct Loaded {
  pub loader: Loader,
  pub graph: TargetGraph,
  pub config: WorkspaceConfig,
}

impl Loader {
  fn new(root: &Path, sources: Arc<SourceSet>, flags: &Flags) -> Self {
    let graph = TargetGraph::new(sources.clone());
    let state = LoadState {
      root: root.to_path_buf(),
      sources,
      flags: flags.clone(),
      graph,
      impls: Vec::new(),
      imports: HashMap::new(),
      file_stack: Vec::new(),
      globs: HashMap::new(),
      macro_dirs: Vec::new(),
      providers: 0,
      config: WorkspaceConfig::default(),
      sealed: false,
    };
    Self {
      lua: Lua::new(),
      state: Rc::new(RefCell::new(state)),
    }
  }

  /// Evaluate `WORKSPACE.lua` and every tracked `BUILD.lua`, then check the
  /// resulting graph.
  ///
  /// Files are visited in sorted order, so rule ids are stable across
  /// loaders of the same tree.
  pub fn load(root: &Path, sources: Arc<SourceSet>, flags: &Flags) -> Result<Loaded, LoadError> {
    let loader = Self::new(root, sources.clone(), flags);
    loader.load_workspace_file()?;

    let build_files: Vec<String> = sources.named(BUILD_FILE).map(str::to_string).collect();
    for file in &build_files {
      loader.eval(file)?;
    }

    let graph = loader.seal();
    sources.exclude_outputs(graph.rules().iter().flat_map(|r| r.outputs.iter().map(String::as_str)));
    validate_static_deps(&graph)?;
    graph.verify()?;
    info!(rules = graph.len(), build_files = build_files.len(), "loaded build files");

    let config = loader.state.borrow().config.clone();
    Ok(Loaded { loader, graph, config })
  }

  /// Evaluate only `WORKSPACE.lua`, for the configuration needed before
  /// sources can be enumerated.
  pub fn read_config(root: &Path, flags: &Flags) -> Result<WorkspaceConfig, LoadError> {
    let sources = Arc::new(SourceSet::from_paths(root, Vec::<String>::new()));
    let loader = Self::new(root, sources, flags);
    loader.load_workspace_file()?;
    let config = loader.state.borrow().config.clone();
    Ok(config)
  }

  fn load_workspace_file(&self) -> Result<(), LoadError> {
    let exists = self.state.borrow().root.join(WORKSPACE_FILE).is_file();
    if exists {
      self.eval(WORKSPACE_FILE)?;
    }
    Ok(())
  }

  fn eval(&self, file: &str) -> Result<LuaValue, LoadError> {
    import_file(&self.lua, &self.state, file).map_err(|e| LoadError::Eval {
      file: file.to_string(),
      message: e.to_string(),
    })
  }

  /// Stop accepting rules and hand the graph out.
  fn seal(&self) -> TargetGraph {
    let mut state = self.state.borrow_mut();
    state.sealed = true;
    let empty = TargetGraph::new(state.sources.clone());
    std::mem::replace(&mut state.graph, empty)
  }

  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  pub fn implementation(&self, id: RuleId) -> Option<LuaFunction> {
    self.state.borrow().impls.get(id).cloned()
  }
}

/// Evaluate a repo-relative Lua file once, returning its result.
///
/// A file returning nothing yields its environment table, so shared
/// definitions can simply be declared as globals of the imported file.
pub(super) fn import_file(lua: &Lua, state: &SharedState, file: &str) -> LuaResult<LuaValue> {
  {
    let s = state.borrow();
    match s.imports.get(file) {
      Some(Import::Done(value)) => return Ok(value.clone()),
      Some(Import::InProgress) => {
        let chain = s.file_stack.join(" -> ");
        return Err(LuaError::external(format!("import cycle: {chain} -> {file}")));
      }
      None => {}
    }
  }

  {
    let mut s = state.borrow_mut();
    s.imports.insert(file.to_string(), Import::InProgress);
    s.file_stack.push(file.to_string());
  }
  let result = eval_file(lua, state, file);
  {
    let mut s = state.borrow_mut();
    s.file_stack.pop();
    match &result {
      Ok(value) => s.imports.insert(file.to_string(), Import::Done(value.clone())),
      Err(_) => s.imports.remove(file),
    };
  }
  result
}

fn eval_file(lua: &Lua, state: &SharedState, file: &str) -> LuaResult<LuaValue> {
  let path = state.borrow().root.join(file);
  let content =
    fs::read_to_string(&path).map_err(|e| LuaError::external(format!("cannot read '{}': {}", path.display(), e)))?;
  debug!(file, "evaluating");

  let env = lua.create_table()?;
  let mt = lua.create_table()?;
  mt.set("__index", lua.globals())?;
  env.set_metatable(Some(mt))?;

  let dir = parent_dir(file).to_string();
  let rivet = create_rivet_table(lua, state, &dir, file == WORKSPACE_FILE)?;
  env.set("rivet", rivet)?;

  let value = lua
    .load(&content)
    .set_name(format!("@{file}"))
    .set_environment(env.clone())
    .eval::<LuaValue>()?;

  Ok(match value {
    LuaValue::Nil => LuaValue::Table(env),
    other => other,
  })
}

fn validate_static_deps(graph: &TargetGraph) -> Result<(), LoadError> {
  for rule in graph.rules() {
    for path in rule.deps.flatten() {
      if graph.lookup(&path).is_err() {
        return Err(LoadError::UnknownDependency {
          rule: rule.label(),
          path,
        });
      }
    }
  }
  Ok(())
}
