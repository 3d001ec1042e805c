//! Conversion between Lua values and [`Value`].

use std::collections::BTreeMap;

use mlua::prelude::*;

use crate::depset::{DepSet, DepSetItem};
use crate::graph::paths::resolve;
use crate::value::Value;

/// Metatable marker of provider instances.
pub const PROVIDER_TYPE: &str = "provider";

/// A dependency set handed to Lua code.
#[derive(Clone, Debug)]
pub struct LuaDepSet(pub DepSet);

impl LuaUserData for LuaDepSet {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
      Ok(this.0.describe())
    });
  }
}

/// Convert a rule's return value.
///
/// Tables with a positive length and a non-nil first element are lists;
/// other tables are maps and must have string keys. Providers are detected
/// via their metatable.
pub fn lua_to_value(value: LuaValue) -> LuaResult<Value> {
  match value {
    LuaValue::Nil => Ok(Value::Nil),
    LuaValue::Boolean(b) => Ok(Value::Boolean(b)),
    LuaValue::Integer(i) => Ok(Value::Integer(i)),
    LuaValue::Number(n) => Ok(Value::Number(n)),
    LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
    LuaValue::Table(t) => {
      if let Some(mt) = t.metatable()
        && let Ok(type_name) = mt.get::<String>("__type")
        && type_name == PROVIDER_TYPE
      {
        let kind: String = mt.get("__kind")?;
        return Ok(Value::Provider {
          kind,
          fields: table_to_map(&t)?,
        });
      }

      let len = t.raw_len();
      let first: LuaValue = t.raw_get(1)?;
      if len > 0 && !first.is_nil() {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
          items.push(lua_to_value(t.raw_get(i)?)?);
        }
        Ok(Value::List(items))
      } else {
        Ok(Value::Map(table_to_map(&t)?))
      }
    }
    LuaValue::UserData(ud) if ud.is::<LuaDepSet>() => Ok(Value::DepSet(ud.borrow::<LuaDepSet>()?.0.clone())),
    other => Err(LuaError::external(format!(
      "a {} cannot be a rule value",
      other.type_name()
    ))),
  }
}

fn table_to_map(t: &LuaTable) -> LuaResult<BTreeMap<String, Value>> {
  let mut map = BTreeMap::new();
  for pair in t.pairs::<LuaValue, LuaValue>() {
    let (k, v) = pair?;
    let key = match k {
      LuaValue::String(s) => s.to_str()?.to_string(),
      other => {
        return Err(LuaError::external(format!(
          "table keys in rule values must be strings, found {}",
          other.type_name()
        )));
      }
    };
    map.insert(key, lua_to_value(v)?);
  }
  Ok(map)
}

/// Build a provider instance table.
pub fn provider_table(lua: &Lua, kind: &str, fields: LuaTable) -> LuaResult<LuaTable> {
  let instance = lua.create_table()?;
  for pair in fields.pairs::<LuaValue, LuaValue>() {
    let (k, v) = pair?;
    instance.raw_set(k, v)?;
  }
  let mt = lua.create_table()?;
  mt.set("__type", PROVIDER_TYPE)?;
  mt.set("__kind", kind)?;
  instance.set_metatable(Some(mt))?;
  Ok(instance)
}

pub fn value_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
  match value {
    Value::Nil => Ok(LuaValue::Nil),
    Value::Boolean(b) => Ok(LuaValue::Boolean(*b)),
    Value::Integer(i) => Ok(LuaValue::Integer(*i)),
    Value::Number(n) => Ok(LuaValue::Number(*n)),
    Value::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
    Value::List(items) => {
      let table = lua.create_table()?;
      for (i, item) in items.iter().enumerate() {
        table.raw_set(i + 1, value_to_lua(lua, item)?)?;
      }
      Ok(LuaValue::Table(table))
    }
    Value::Map(map) => Ok(LuaValue::Table(map_to_table(lua, map)?)),
    Value::DepSet(set) => Ok(LuaValue::UserData(lua.create_userdata(LuaDepSet(set.clone()))?)),
    Value::Provider { kind, fields } => {
      let fields = map_to_table(lua, fields)?;
      Ok(LuaValue::Table(provider_table(lua, kind, fields)?))
    }
  }
}

fn map_to_table(lua: &Lua, map: &BTreeMap<String, Value>) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  for (k, v) in map {
    table.raw_set(k.as_str(), value_to_lua(lua, v)?)?;
  }
  Ok(table)
}

/// Collect dependency items from a Lua value: path strings (resolved
/// against `dir`), lists of items, and depsets.
pub fn collect_dep_items(dir: &str, value: LuaValue, out: &mut Vec<DepSetItem>) -> LuaResult<()> {
  match value {
    LuaValue::Nil => Ok(()),
    LuaValue::String(s) => {
      let path = resolve(dir, &s.to_str()?).map_err(LuaError::external)?;
      out.push(DepSetItem::Path(path));
      Ok(())
    }
    LuaValue::Table(t) => {
      for item in t.sequence_values::<LuaValue>() {
        collect_dep_items(dir, item?, out)?;
      }
      Ok(())
    }
    LuaValue::UserData(ud) if ud.is::<LuaDepSet>() => {
      out.push(DepSetItem::Set(ud.borrow::<LuaDepSet>()?.0.clone()));
      Ok(())
    }
    other => Err(LuaError::external(format!(
      "expected a path, a list or a depset, found {}",
      other.type_name()
    ))),
  }
}

/// Parse an optional `{ env = { KEY = "value" } }` options table.
pub fn parse_env(opts: Option<LuaTable>) -> LuaResult<BTreeMap<String, String>> {
  let mut env = BTreeMap::new();
  let Some(opts) = opts else {
    return Ok(env);
  };
  if let Some(vars) = opts.get::<Option<LuaTable>>("env")? {
    for pair in vars.pairs::<String, String>() {
      let (k, v) = pair?;
      env.insert(k, v);
    }
  }
  Ok(env)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lists_and_maps() -> LuaResult<()> {
    let lua = Lua::new();
    let value = lua_to_value(lua.load(r#"return { 1, "two", { a = true } }"#).eval()?)?;
    assert_eq!(value.to_json(), serde_json::json!([1, "two", { "a": true }]));
    Ok(())
  }

  #[test]
  fn functions_are_rejected() -> LuaResult<()> {
    let lua = Lua::new();
    let value: LuaValue = lua.load("return function() end").eval()?;
    assert!(lua_to_value(value).is_err());
    Ok(())
  }

  #[test]
  fn providers_survive_a_round_trip() -> LuaResult<()> {
    let lua = Lua::new();
    let fields = lua.create_table()?;
    fields.set("headers", "include/")?;
    let instance = provider_table(&lua, "CcInfo", fields)?;

    let value = lua_to_value(LuaValue::Table(instance))?;
    assert!(matches!(value, Value::Provider { ref kind, .. } if kind == "CcInfo"));

    let back = value_to_lua(&lua, &value)?;
    lua.globals().set("v", back)?;
    let kind: String = lua.load("return getmetatable(v).__kind").eval()?;
    let headers: String = lua.load("return v.headers").eval()?;
    assert_eq!(kind, "CcInfo");
    assert_eq!(headers, "include/");
    Ok(())
  }

  #[test]
  fn depsets_pass_through() -> LuaResult<()> {
    let lua = Lua::new();
    let ud = lua.create_userdata(LuaDepSet(DepSet::new(["a.c"])))?;
    let value = lua_to_value(LuaValue::UserData(ud))?;
    assert!(matches!(value, Value::DepSet(ref s) if s.flatten() == vec!["a.c"]));
    Ok(())
  }

  #[test]
  fn dep_items_resolve_relative_paths() -> LuaResult<()> {
    let lua = Lua::new();
    let value: LuaValue = lua.load(r#"return { "a.c", { "//top.h", ":tool" } }"#).eval()?;
    let mut items = Vec::new();
    collect_dep_items("src", value, &mut items)?;
    let set = DepSet::new(items);
    assert_eq!(set.flatten(), vec!["src/a.c", "top.h", ":tool"]);
    Ok(())
  }

  #[test]
  fn env_options() -> LuaResult<()> {
    let lua = Lua::new();
    let opts: LuaTable = lua.load(r#"return { env = { CC = "clang" } }"#).eval()?;
    let env = parse_env(Some(opts))?;
    assert_eq!(env.get("CC").map(String::as_str), Some("clang"));
    assert!(parse_env(None)?.is_empty());
    Ok(())
  }
}
