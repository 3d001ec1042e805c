//! The `rivet` table given to every build file.
//!
//! - `rivet.rule{}`: register a rule
//! - `rivet.glob()`: tracked sources matching a pattern, as a depset
//! - `rivet.resolve()`: repo-relative form of a path
//! - `rivet.import()`: evaluate another file once and share its result
//! - `rivet.macro()`: wrap a rule generator so paths follow the caller
//! - `rivet.provider()`: define a typed result carrier
//! - `rivet.depset()`: combine paths and depsets
//! - `rivet.flags`, `rivet.dir`
//! - `rivet.config` (`WORKSPACE.lua` only)

use mlua::prelude::*;
use semver::Version;

use super::convert::{LuaDepSet, PROVIDER_TYPE, collect_dep_items, provider_table};
use super::loader::{SharedState, import_file};
use crate::consts::VERSION;
use crate::depset::DepSet;
use crate::graph::RuleDecl;
use crate::graph::paths::{parent_dir, resolve, resolve_target_path};

pub(super) fn create_rivet_table(lua: &Lua, state: &SharedState, dir: &str, workspace: bool) -> LuaResult<LuaTable> {
  let rivet = lua.create_table()?;
  rivet.set("dir", dir)?;

  let flags = lua.create_table()?;
  for (k, v) in &state.borrow().flags {
    flags.set(k.as_str(), v.as_str())?;
  }
  rivet.set("flags", flags)?;

  rivet.set("rule", create_rule(lua, state.clone(), dir.to_string())?)?;
  rivet.set("glob", create_glob(lua, state.clone(), dir.to_string())?)?;
  rivet.set("resolve", create_resolve(lua, state.clone(), dir.to_string())?)?;
  rivet.set("import", create_import(lua, state.clone(), dir.to_string())?)?;
  rivet.set("macro", create_macro(lua, state.clone())?)?;
  rivet.set("provider", create_provider(lua, state.clone())?)?;
  rivet.set("depset", create_depset(lua, state.clone(), dir.to_string())?)?;

  if workspace {
    rivet.set("config", create_config(lua, state.clone())?)?;
  }
  Ok(rivet)
}

fn create_rule(lua: &Lua, state: SharedState, file_dir: String) -> LuaResult<LuaFunction> {
  lua.create_function(move |_, args: LuaTable| {
    let (dir, build_file) = {
      let s = state.borrow();
      if s.sealed {
        return Err(LuaError::external("rivet.rule can only be called while build files load"));
      }
      (s.effective_dir(&file_dir), s.current_file().to_string())
    };

    let name: Option<String> = args.get("name")?;
    if let Some(name) = &name
      && (name.is_empty() || name.contains(['/', ':']))
    {
      return Err(LuaError::external(format!("invalid rule name '{name}'")));
    }

    let implementation: LuaFunction = args
      .get::<Option<LuaFunction>>("impl")?
      .ok_or_else(|| LuaError::external("rivet.rule requires an `impl` function"))?;

    let mut deps = Vec::new();
    collect_dep_items(&dir, args.get("deps")?, &mut deps)?;

    let outputs = args
      .get::<Option<Vec<String>>>("outs")?
      .unwrap_or_default()
      .iter()
      .map(|out| resolve_target_path(&dir, out))
      .collect::<Result<Vec<_>, _>>()
      .map_err(LuaError::external)?;

    let do_not_symlink = args.get::<Option<bool>>("do_not_symlink")?.unwrap_or(false);

    let mut s = state.borrow_mut();
    let id = s
      .graph
      .register(RuleDecl {
        name,
        dir,
        build_file,
        deps: DepSet::new(deps),
        outputs,
        do_not_symlink,
      })
      .map_err(LuaError::external)?;
    s.impls.push(implementation);

    let rule = s.graph.rule(id);
    Ok(match &rule.name {
      Some(name) => format!(":{name}"),
      None => format!("//{}", rule.outputs[0]),
    })
  })
}

fn create_glob(lua: &Lua, state: SharedState, file_dir: String) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, pattern: String| {
    let dir = state.borrow().effective_dir(&file_dir);
    let key = (dir.clone(), pattern.clone());
    let cached = state.borrow().globs.get(&key).cloned();
    let set = match cached {
      Some(set) => set,
      None => {
        let sources = state.borrow().sources.clone();
        let set = sources.glob(&dir, &pattern).map_err(LuaError::external)?;
        state.borrow_mut().globs.insert(key, set.clone());
        set
      }
    };
    lua.create_userdata(LuaDepSet(set))
  })
}

fn create_resolve(lua: &Lua, state: SharedState, file_dir: String) -> LuaResult<LuaFunction> {
  lua.create_function(move |_, path: String| {
    let dir = state.borrow().effective_dir(&file_dir);
    resolve(&dir, &path).map_err(LuaError::external)
  })
}

fn create_import(lua: &Lua, state: SharedState, file_dir: String) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, path: String| {
    let dir = state.borrow().effective_dir(&file_dir);
    let file = resolve_target_path(&dir, &path).map_err(LuaError::external)?;
    import_file(lua, &state, &file)
  })
}

/// `rivet.macro(fn)` returns a wrapper of `fn`. While the wrapper runs,
/// rules, globs and paths resolve against the directory of the file calling
/// it, not the file defining it.
fn create_macro(lua: &Lua, state: SharedState) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, generator: LuaFunction| {
    let state = state.clone();
    lua.create_function(move |_, args: LuaMultiValue| {
      let caller_dir = parent_dir(state.borrow().current_file()).to_string();
      state.borrow_mut().macro_dirs.push(caller_dir);
      let result = generator.call::<LuaMultiValue>(args);
      state.borrow_mut().macro_dirs.pop();
      result
    })
  })
}

fn provider_kind(value: &LuaValue) -> Option<String> {
  let LuaValue::Table(t) = value else {
    return None;
  };
  let mt = t.metatable()?;
  let type_name: String = mt.get("__type").ok()?;
  if type_name != PROVIDER_TYPE {
    return None;
  }
  mt.get("__kind").ok()
}

/// `rivet.provider(name?)` returns a constructor `P`: `P{...}` creates a
/// tagged record and `P.is(v)` tests for one.
fn create_provider(lua: &Lua, state: SharedState) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, name: Option<String>| {
    let kind = match name {
      Some(name) => name,
      None => {
        let mut s = state.borrow_mut();
        s.providers += 1;
        format!("{}#{}", s.current_file(), s.providers)
      }
    };

    let constructor = lua.create_table()?;
    constructor.set("kind", kind.as_str())?;

    let is_kind = kind.clone();
    constructor.set(
      "is",
      lua.create_function(move |_, value: LuaValue| Ok(provider_kind(&value).as_deref() == Some(is_kind.as_str())))?,
    )?;

    let mt = lua.create_table()?;
    mt.set(
      "__call",
      lua.create_function(move |lua, (_, fields): (LuaValue, Option<LuaTable>)| {
        let fields = match fields {
          Some(fields) => fields,
          None => lua.create_table()?,
        };
        provider_table(lua, &kind, fields)
      })?,
    )?;
    constructor.set_metatable(Some(mt))?;
    Ok(constructor)
  })
}

fn create_depset(lua: &Lua, state: SharedState, file_dir: String) -> LuaResult<LuaFunction> {
  lua.create_function(move |lua, children: LuaMultiValue| {
    let dir = state.borrow().effective_dir(&file_dir);
    let mut items = Vec::new();
    for child in children {
      collect_dep_items(&dir, child, &mut items)?;
    }
    lua.create_userdata(LuaDepSet(DepSet::new(items)))
  })
}

/// `rivet.config`: one-time workspace settings.
fn create_config(lua: &Lua, state: SharedState) -> LuaResult<LuaTable> {
  let config = lua.create_table()?;

  let s = state.clone();
  config.set(
    "register_default_setup_rule",
    lua.create_function(move |_, target: String| {
      let target = resolve("", &target).map_err(LuaError::external)?;
      let mut st = s.borrow_mut();
      let slot = &mut st.config.default_setup_rule;
      if let Some(existing) = slot {
        return Err(LuaError::external(format!(
          "default setup rule already registered as {existing}"
        )));
      }
      *slot = Some(target);
      Ok(())
    })?,
  )?;

  let s = state.clone();
  config.set(
    "register_default_build_rule",
    lua.create_function(move |_, target: String| {
      let target = resolve("", &target).map_err(LuaError::external)?;
      let mut st = s.borrow_mut();
      let slot = &mut st.config.default_build_rule;
      if let Some(existing) = slot {
        return Err(LuaError::external(format!(
          "default build rule already registered as {existing}"
        )));
      }
      *slot = Some(target);
      Ok(())
    })?,
  )?;

  let s = state.clone();
  config.set(
    "register_output_directory",
    lua.create_function(move |_, dir: String| {
      let mut dir = resolve_target_path("", &dir).map_err(LuaError::external)?;
      if !dir.ends_with('/') {
        dir.push('/');
      }
      let mut st = s.borrow_mut();
      let dirs = &mut st.config.output_directories;
      if dirs.contains(&dir) {
        return Err(LuaError::external(format!("output directory {dir} already registered")));
      }
      dirs.push(dir);
      Ok(())
    })?,
  )?;

  config.set(
    "require_minimum_version",
    lua.create_function(move |_, required: String| {
      let wanted = Version::parse(&required)
        .map_err(|e| LuaError::external(format!("invalid version '{required}': {e}")))?;
      let current = Version::parse(VERSION).map_err(LuaError::external)?;
      if current < wanted {
        return Err(LuaError::external(format!(
          "this workspace requires rivet {wanted} or newer, but this is {current}"
        )));
      }
      state.borrow_mut().config.minimum_version = Some(wanted.to_string());
      Ok(())
    })?,
  )?;

  Ok(config)
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::path::Path;
  use std::sync::Arc;

  use tempfile::tempdir;

  use crate::graph::SourceSet;
  use crate::lua::{Flags, Loaded, Loader};

  fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
  }

  fn load(root: &Path, flags: &Flags) -> Loaded {
    let sources = Arc::new(SourceSet::scan(root, &[]).unwrap());
    match Loader::load(root, sources, flags) {
      Ok(loaded) => loaded,
      Err(e) => panic!("load failed: {e}"),
    }
  }

  #[test]
  fn glob_collects_tracked_sources() {
    let temp = tempdir().unwrap();
    write(temp.path(), "src/a.c", "");
    write(temp.path(), "src/b.c", "");
    write(temp.path(), "src/b.h", "");
    write(
      temp.path(),
      "src/BUILD.lua",
      r#"rivet.rule{ name = "lib", deps = { rivet.glob("*.c") }, outs = { "lib.a" }, impl = function() end }"#,
    );
    let loaded = load(temp.path(), &Flags::new());
    let rule = loaded.graph.rule(0);
    assert_eq!(rule.deps.flatten(), vec!["src/a.c", "src/b.c"]);
  }

  #[test]
  fn macros_resolve_against_the_caller() {
    let temp = tempdir().unwrap();
    write(
      temp.path(),
      "tools/defs.lua",
      r#"
        copy = rivet.macro(function(name, src)
          return rivet.rule{ name = name, deps = { src }, outs = { name .. ".out" }, impl = function() end }
        end)
        helper_dir = rivet.resolve("x")
      "#,
    );
    write(temp.path(), "app/main.txt", "");
    write(
      temp.path(),
      "app/BUILD.lua",
      r#"
        local defs = rivet.import("//tools/defs.lua")
        defs.copy("main", "main.txt")
      "#,
    );
    let loaded = load(temp.path(), &Flags::new());
    let rule = loaded.graph.rule(0);
    assert_eq!(rule.dir, "app");
    assert_eq!(rule.outputs, vec!["app/main.out"]);
    assert_eq!(rule.deps.flatten(), vec!["app/main.txt"]);
    assert_eq!(rule.build_file, "app/BUILD.lua");
  }

  #[test]
  fn providers_are_typed() {
    let temp = tempdir().unwrap();
    write(
      temp.path(),
      "BUILD.lua",
      r#"
        local Info = rivet.provider("Info")
        local Other = rivet.provider()
        local v = Info{ path = "x" }
        assert(Info.is(v))
        assert(not Other.is(v))
        assert(not Info.is({ path = "x" }))
        assert(v.path == "x")
        assert(Info.kind == "Info")
      "#,
    );
    load(temp.path(), &Flags::new());
  }

  #[test]
  fn depset_and_resolve() {
    let temp = tempdir().unwrap();
    write(temp.path(), "lib/a.h", "");
    write(temp.path(), "lib/b.h", "");
    write(
      temp.path(),
      "lib/BUILD.lua",
      r#"
        assert(rivet.resolve("../x/y") == "x/y")
        assert(rivet.dir == "lib")
        local hdrs = rivet.depset("a.h", { "b.h" }, rivet.depset("a.h"))
        rivet.rule{ name = "h", deps = { hdrs }, outs = { "h.stamp" }, impl = function() end }
      "#,
    );
    let loaded = load(temp.path(), &Flags::new());
    assert_eq!(loaded.graph.rule(0).deps.flatten(), vec!["lib/a.h", "lib/b.h"]);
  }

  #[test]
  fn flags_are_visible() {
    let temp = tempdir().unwrap();
    write(temp.path(), "BUILD.lua", r#"assert(rivet.flags.mode == "release")"#);
    let mut flags = Flags::new();
    flags.insert("mode".to_string(), "release".to_string());
    load(temp.path(), &flags);
  }

  #[test]
  fn invalid_rule_names_are_rejected() {
    let temp = tempdir().unwrap();
    write(
      temp.path(),
      "BUILD.lua",
      r#"rivet.rule{ name = "a/b", outs = { "o" }, impl = function() end }"#,
    );
    let sources = Arc::new(SourceSet::scan(temp.path(), &[]).unwrap());
    assert!(Loader::load(temp.path(), sources, &Flags::new()).is_err());
  }
}
