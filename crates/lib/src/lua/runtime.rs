use std::cell::RefCell;
use std::rc::Rc;

use mlua::prelude::*;
use serde_json::json;

use super::Loader;
use super::convert::lua_to_value;
use super::ctx::LuaContext;
use crate::context::{ContextError, ExecutionContext};
use crate::graph::Rule;
use crate::value::Value;

/// What one run of a rule implementation observed.
#[derive(Debug, Clone)]
pub struct RuleRun {
  /// Final fingerprint: the cache key.
  pub key: String,
  /// Every dependency and input path, in first-use order.
  pub inputs: Vec<String>,
  pub value: Value,
}

/// Run `rule`'s implementation inside `context`.
///
/// The rule's identity and its static dependencies are recorded before the
/// implementation is called. Scheduling signals raised inside the
/// implementation are returned even if Lua code caught them.
pub fn run_rule<C: ExecutionContext + 'static>(loader: &Loader, rule: &Rule, context: C) -> Result<RuleRun, ContextError> {
  let ctx = Rc::new(RefCell::new(context));
  {
    let mut c = ctx.borrow_mut();
    c.base_mut().record(json!(["rule", rule.name, rule.dir, rule.outputs]));
    c.add_deps(rule.deps.flatten())?;
  }

  let rule_err = |message: String| ContextError::Rule {
    rule: rule.label(),
    message,
  };
  let implementation = loader
    .implementation(rule.id)
    .ok_or_else(|| rule_err("no implementation registered".to_string()))?;

  let handle: Rc<RefCell<dyn ExecutionContext>> = ctx.clone();
  let returned = implementation.call::<LuaValue>(LuaContext::new(handle));

  let mut c = ctx.borrow_mut();
  if let Some(failure) = c.base_mut().take_failure() {
    return Err(failure);
  }
  let returned = returned.map_err(|e| rule_err(e.to_string()))?;
  c.flush()?;
  let value = lua_to_value(returned).map_err(|e| rule_err(e.to_string()))?;

  Ok(RuleRun {
    key: c.base().key(),
    inputs: c.base().inputs().to_vec(),
    value,
  })
}

#[cfg(all(test, unix))]
mod tests {
  use std::fs;
  use std::path::Path;
  use std::sync::Arc;

  use tempfile::tempdir;

  use super::*;
  use crate::context::testing::{Ready, memory_cache};
  use crate::context::{ContextBase, ExecuteContext, PreviewContext};
  use crate::graph::{SourceSet, TargetGraph};
  use crate::lua::{Flags, Loaded};

  fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
  }

  fn load(root: &Path) -> (Loaded, Arc<TargetGraph>) {
    let sources = Arc::new(SourceSet::scan(root, &[]).unwrap());
    let mut loaded = match Loader::load(root, sources.clone(), &Flags::new()) {
      Ok(loaded) => loaded,
      Err(e) => panic!("{e}"),
    };
    let graph = Arc::new(std::mem::replace(&mut loaded.graph, TargetGraph::new(sources)));
    (loaded, graph)
  }

  fn base(root: &Path, graph: &Arc<TargetGraph>, id: usize, ready: Arc<Ready>) -> ContextBase {
    ContextBase::new(id, root.to_path_buf(), graph.clone(), memory_cache(), ready)
  }

  #[test]
  fn preview_and_execution_agree_on_the_key() {
    let temp = tempdir().unwrap();
    write(temp.path(), "a.txt", "hello");
    write(
      temp.path(),
      "BUILD.lua",
      r#"
        rivet.rule{ name = "copy", deps = { "a.txt" }, outs = { "b.txt" }, impl = function(ctx)
          ctx:sh("cp a.txt b.txt")
          return "copied"
        end }
      "#,
    );
    let (loaded, graph) = load(temp.path());
    let rule = graph.rule(0);

    let preview = run_rule(
      &loaded.loader,
      rule,
      PreviewContext::new(base(temp.path(), &graph, 0, Arc::default())),
    )
    .unwrap();
    assert!(!temp.path().join("b.txt").exists());

    let exec = run_rule(
      &loaded.loader,
      rule,
      ExecuteContext::new(base(temp.path(), &graph, 0, Arc::default()), false),
    )
    .unwrap();
    assert_eq!(fs::read_to_string(temp.path().join("b.txt")).unwrap(), "hello");
    assert_eq!(preview.key, exec.key);
    assert_eq!(exec.inputs, vec!["a.txt"]);
    assert!(matches!(exec.value, Value::String(ref s) if s == "copied"));
  }

  #[test]
  fn caught_signals_still_surface() {
    let temp = tempdir().unwrap();
    write(
      temp.path(),
      "BUILD.lua",
      r#"
        rivet.rule{ name = "dep", outs = { "d.txt" }, impl = function(ctx) end }
        rivet.rule{ name = "user", outs = { "u.txt" }, impl = function(ctx)
          pcall(function() ctx:value(":dep") end)
        end }
      "#,
    );
    let (loaded, graph) = load(temp.path());
    let err = run_rule(
      &loaded.loader,
      graph.rule(1),
      PreviewContext::new(base(temp.path(), &graph, 1, Arc::default())),
    )
    .unwrap_err();
    assert!(matches!(err, ContextError::Missing(ref p) if p == &[":dep".to_string()]));
  }

  #[test]
  fn values_flow_between_rules() {
    let temp = tempdir().unwrap();
    write(
      temp.path(),
      "BUILD.lua",
      r#"
        local Info = rivet.provider("Info")
        rivet.rule{ name = "dep", outs = { "d.txt" }, impl = function(ctx)
          ctx:sh("echo d > d.txt")
          return Info{ flag = "-O2" }
        end }
        rivet.rule{ name = "user", outs = { "u.txt" }, impl = function(ctx)
          local info = ctx:value(":dep")
          assert(Info.is(info))
          ctx:sh("echo " .. info.flag .. " > u.txt")
        end }
      "#,
    );
    let (loaded, graph) = load(temp.path());
    let ready = Arc::new(Ready::default());

    let dep = run_rule(
      &loaded.loader,
      graph.rule(0),
      ExecuteContext::new(base(temp.path(), &graph, 0, ready.clone()), false),
    )
    .unwrap();
    ready.mark(0, dep.value);

    run_rule(
      &loaded.loader,
      graph.rule(1),
      ExecuteContext::new(base(temp.path(), &graph, 1, ready), false),
    )
    .unwrap();
    assert_eq!(fs::read_to_string(temp.path().join("u.txt")).unwrap(), "-O2\n");
  }

  #[test]
  fn lua_errors_name_the_rule() {
    let temp = tempdir().unwrap();
    write(
      temp.path(),
      "BUILD.lua",
      r#"rivet.rule{ name = "bad", outs = { "o" }, impl = function(ctx) error("boom") end }"#,
    );
    let (loaded, graph) = load(temp.path());
    let err = run_rule(
      &loaded.loader,
      graph.rule(0),
      PreviewContext::new(base(temp.path(), &graph, 0, Arc::default())),
    )
    .unwrap_err();
    match err {
      ContextError::Rule { rule, message } => {
        assert_eq!(rule, ":bad");
        assert!(message.contains("boom"), "{message}");
      }
      other => panic!("unexpected error: {other}"),
    }
  }
}
