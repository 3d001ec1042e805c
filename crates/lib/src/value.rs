//! Values produced by rule implementations.
//!
//! Interpreters are confined to the worker thread that created them, so a
//! rule's result is converted into this plain enum before it is published to
//! other workers. Conversion to and from Lua lives in [`crate::lua::convert`].

use std::collections::BTreeMap;

use serde_json::json;

use crate::depset::DepSet;

#[derive(Debug, Clone, Default)]
pub enum Value {
  #[default]
  Nil,
  Boolean(bool),
  Integer(i64),
  Number(f64),
  String(String),
  List(Vec<Value>),
  Map(BTreeMap<String, Value>),
  DepSet(DepSet),
  /// A tagged record created by a `rivet.provider` constructor.
  Provider {
    kind: String,
    fields: BTreeMap<String, Value>,
  },
}

impl Value {
  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  /// Canonical JSON form, mixed into the fingerprint of every rule that
  /// depends on the producer.
  ///
  /// Depsets are flattened; providers carry their kind so that two providers
  /// with equal fields but different kinds never hash alike.
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Nil => serde_json::Value::Null,
      Value::Boolean(b) => json!(b),
      Value::Integer(i) => json!(i),
      Value::Number(n) => serde_json::Number::from_f64(*n)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| json!(n.to_string())),
      Value::String(s) => json!(s),
      Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
      Value::Map(map) => map_to_json(map),
      Value::DepSet(set) => json!({ "depset": set.flatten() }),
      Value::Provider { kind, fields } => json!({ "provider": kind, "fields": map_to_json(fields) }),
    }
  }
}

fn map_to_json(map: &BTreeMap<String, Value>) -> serde_json::Value {
  serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}
