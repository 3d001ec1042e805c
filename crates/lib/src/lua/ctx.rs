//! The `ctx` object passed to rule implementations.
//!
//! ```lua
//! impl = function(ctx)
//!   local srcs = ctx:add_deps(rivet.glob("*.c"))
//!   ctx:sh("cc -c " .. table.concat(srcs, " "), { env = { CC = "clang" } })
//!   local version = ctx:input("VERSION")
//!   local rev = ctx:input_sh("git rev-parse HEAD")
//!   local tool = ctx:value(":toolchain")
//!   return { version = version }
//! end
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use mlua::prelude::*;

use super::convert::{collect_dep_items, parse_env, value_to_lua};
use crate::context::{ContextError, ExecutionContext};
use crate::depset::DepSet;
use crate::graph::paths::{is_rule_ref, relative_to, resolve, resolve_target_path};

pub struct LuaContext(Rc<RefCell<dyn ExecutionContext>>);

impl LuaContext {
  pub fn new(ctx: Rc<RefCell<dyn ExecutionContext>>) -> Self {
    Self(ctx)
  }

  fn dir(&self) -> String {
    self.0.borrow().base().dir.clone()
  }

  /// Run a context operation, parking any error in the context before it
  /// is raised into Lua.
  fn call<T>(&self, op: impl FnOnce(&mut dyn ExecutionContext) -> Result<T, ContextError>) -> LuaResult<T> {
    let mut ctx = self.0.borrow_mut();
    if ctx.base().failed() {
      return Err(LuaError::external("the rule context has already failed"));
    }
    op(&mut *ctx).map_err(|e| {
      let message = e.to_string();
      ctx.base_mut().fail(e);
      LuaError::external(message)
    })
  }
}

impl LuaUserData for LuaContext {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("dir", |_, this| Ok(this.dir()));
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method("add_deps", |lua, this, deps: LuaMultiValue| {
      let dir = this.dir();
      let mut items = Vec::new();
      for dep in deps {
        collect_dep_items(&dir, dep, &mut items)?;
      }
      let paths = DepSet::new(items).flatten();
      let added = this.call(|ctx| ctx.add_deps(paths))?;
      lua.create_sequence_from(added)
    });

    methods.add_method("sh", |_, this, (cmd, opts): (String, Option<LuaTable>)| {
      let env = parse_env(opts)?;
      this.call(|ctx| ctx.sh(&cmd, &env))
    });

    methods.add_method("input", |_, this, path: String| {
      let path = resolve_target_path(&this.dir(), &path).map_err(LuaError::external)?;
      this.call(|ctx| ctx.input_file(&path))
    });

    methods.add_method("input_sh", |_, this, (cmd, opts): (String, Option<LuaTable>)| {
      let env = parse_env(opts)?;
      this.call(|ctx| ctx.input_sh(&cmd, &env))
    });

    methods.add_method("value", |lua, this, name: String| {
      if !is_rule_ref(&name) {
        return Err(LuaError::external(format!("ctx:value expects a :name reference, got '{name}'")));
      }
      let value = this.call(|ctx| ctx.value(&name))?;
      value_to_lua(lua, &value)
    });

    methods.add_method("relative", |_, this, path: String| {
      let dir = this.dir();
      let target = resolve(&dir, &path).map_err(LuaError::external)?;
      Ok(relative_to(&dir, &target))
    });
  }
}
