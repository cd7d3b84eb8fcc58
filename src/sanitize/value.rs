//! Dynamic value model for sanitization input
//!
//! Lists and maps are shared containers so callers can hand the sanitizer
//! graphs that refer back to themselves. Container identity is the address
//! of the shared allocation.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub type SharedList = Arc<RwLock<Vec<Value>>>;
pub type SharedMap = Arc<RwLock<BTreeMap<String, Value>>>;

/// Kind of a non-plain value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpaqueKind {
    Date,
    Function,
    Pattern,
    Other,
}

/// Arbitrary structured value
#[derive(Clone)]
pub enum Value {
    Null,
    /// Distinct from `Null`: the field existed but carried no value at all
    Undefined,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(SharedList),
    Map(SharedMap),
    /// Non-plain value, sanitized through its string rendering
    Opaque { kind: OpaqueKind, repr: String },
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(RwLock::new(items)))
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(Arc::new(RwLock::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn empty_map() -> Self {
        Value::Map(Arc::new(RwLock::new(BTreeMap::new())))
    }

    pub fn timestamp(ts: DateTime<Utc>) -> Self {
        Value::Opaque {
            kind: OpaqueKind::Date,
            repr: ts.to_rfc3339(),
        }
    }

    pub fn opaque(kind: OpaqueKind, repr: impl Into<String>) -> Self {
        Value::Opaque {
            kind,
            repr: repr.into(),
        }
    }

    /// Insert into a map value. Returns false for non-maps.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> bool {
        match self {
            Value::Map(map) => {
                map.write().insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Append to a list value. Returns false for non-lists.
    pub fn push(&self, value: Value) -> bool {
        match self {
            Value::List(list) => {
                list.write().push(value);
                true
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key on a map value
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Map(map) => map.read().get(key).cloned(),
            _ => None,
        }
    }

    /// Element of a list value
    pub fn at(&self, index: usize) -> Option<Value> {
        match self {
            Value::List(list) => list.read().get(index).cloned(),
            _ => None,
        }
    }

    /// Identity of a shared container
    pub(crate) fn container_id(&self) -> Option<usize> {
        match self {
            Value::List(list) => Some(Arc::as_ptr(list) as *const () as usize),
            Value::Map(map) => Some(Arc::as_ptr(map) as *const () as usize),
            _ => None,
        }
    }

    /// Convert to JSON. Re-entered containers render as `"[CIRCULAR]"`,
    /// `Undefined` becomes `null`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut visiting = HashSet::new();
        self.to_json_inner(&mut visiting)
    }

    fn to_json_inner(&self, visiting: &mut HashSet<usize>) -> serde_json::Value {
        match self {
            Value::Null | Value::Undefined => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Opaque { repr, .. } => serde_json::Value::String(repr.clone()),
            Value::List(list) => {
                let id = Arc::as_ptr(list) as *const () as usize;
                if !visiting.insert(id) {
                    return serde_json::Value::String("[CIRCULAR]".to_string());
                }
                let items: Vec<Value> = list.read().clone();
                let out = items.iter().map(|v| v.to_json_inner(visiting)).collect();
                visiting.remove(&id);
                serde_json::Value::Array(out)
            }
            Value::Map(map) => {
                let id = Arc::as_ptr(map) as *const () as usize;
                if !visiting.insert(id) {
                    return serde_json::Value::String("[CIRCULAR]".to_string());
                }
                let entries: Vec<(String, Value)> =
                    map.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let out = entries
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json_inner(visiting)))
                    .collect();
                visiting.remove(&id);
                serde_json::Value::Object(out)
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => {
                Value::map(entries.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

// Containers print their size only; a derived impl would recurse forever on
// self-referential input.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Undefined => f.write_str("Undefined"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::List(list) => write!(f, "List(len={})", list.read().len()),
            Value::Map(map) => write!(f, "Map(len={})", map.read().len()),
            Value::Opaque { kind, repr } => write!(f, "Opaque({:?}, {:?})", kind, repr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip() {
        let original = json!({"a": [1, "two", null, true], "b": {"c": 1.5}});
        assert_eq!(Value::from(original.clone()).to_json(), original);
    }

    #[test]
    fn test_self_reference_renders_sentinel() {
        let root = Value::empty_map();
        root.insert("name", Value::from("loop"));
        root.insert("me", root.clone());

        let json = root.to_json();
        assert_eq!(json["name"], "loop");
        assert_eq!(json["me"], "[CIRCULAR]");
    }

    #[test]
    fn test_shared_but_acyclic_is_not_circular() {
        let shared = Value::list(vec![Value::from(1)]);
        let root = Value::map([("a", shared.clone()), ("b", shared)]);

        let json = root.to_json();
        assert_eq!(json["a"], json!([1]));
        assert_eq!(json["b"], json!([1]));
    }

    #[test]
    fn test_debug_does_not_recurse() {
        let list = Value::list(vec![]);
        list.push(list.clone());
        assert_eq!(format!("{:?}", list), "List(len=1)");
    }
}
