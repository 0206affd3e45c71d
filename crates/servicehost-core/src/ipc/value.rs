//! Dynamically typed payload tree carried by messages.
//!
//! On the wire every node is tagged so that callbacks and paths survive a
//! round trip:
//!
//! ```text
//! {"type": "map", "value": {"msg": {"type": "string", "value": "hi"}}}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Map(BTreeMap<String, Value>),
    List(Vec<Value>),
    /// Opaque handle naming a client-side callback.
    Callback(i64),
    Path(PathBuf),
}

/// Node kinds, used for structural checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Boolean,
    Integer,
    Double,
    String,
    Map,
    List,
    Callback,
    Path,
}

impl Value {
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
            Value::Map(_) => ValueKind::Map,
            Value::List(_) => ValueKind::List,
            Value::Callback(_) => ValueKind::Callback,
            Value::Path(_) => ValueKind::Path,
        }
    }

    /// Builder-style insert for map values. Non-maps are left untouched.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if let Value::Map(m) = self {
            m.insert(key.to_string(), value.into());
        }
    }

    /// Look up a `/`-separated key path through nested maps.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('/').try_fold(self, |node, key| match node {
            Value::Map(m) => m.get(key),
            _ => None,
        })
    }

    /// True when `path` exists and holds a node of `kind`.
    pub fn has(&self, path: &str, kind: ValueKind) -> bool {
        self.get(path).is_some_and(|v| v.kind() == kind)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<i64> {
        match self {
            Value::Callback(c) => Some(*c),
            _ => None,
        }
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Number of entries in a map or list; zero for leaves.
    pub fn len(&self) -> usize {
        match self {
            Value::Map(m) => m.len(),
            Value::List(l) => l.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Untagged JSON form. Callbacks become integers and paths strings, so
    /// this direction loses kind information.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Boolean(b) => J::Bool(*b),
            Value::Integer(i) | Value::Callback(i) => J::from(*i),
            Value::Double(d) => J::from(*d),
            Value::String(s) => J::String(s.clone()),
            Value::Path(p) => J::String(p.to_string_lossy().into_owned()),
            Value::Map(m) => J::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::List(l) => J::Array(l.iter().map(Value::to_json).collect()),
        }
    }

    /// Deserialize a typed struct from this tree via its untagged form.
    pub fn deserialize_into<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    /// Build a tree from any serializable struct.
    pub fn from_serialize<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(serde_json::to_value(value)?.into())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match v {
            J::Null => Value::Null,
            J::Bool(b) => Value::Boolean(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or_default()),
            },
            J::String(s) => Value::String(s),
            J::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            J::Object(o) => Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<PathBuf> for Value {
    fn from(v: PathBuf) -> Self {
        Value::Path(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_form_is_tagged() {
        let v = Value::map().with("cb", Value::Callback(7));
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "map", "value": {"cb": {"type": "callback", "value": 7}}})
        );
        assert_eq!(serde_json::to_value(Value::Null).unwrap(), serde_json::json!({"type": "null"}));
    }

    #[test]
    fn test_path_lookup() {
        let v = Value::map().with("version", Value::map().with("major", 2i64));
        assert_eq!(v.get_i64("version/major"), Some(2));
        assert!(v.has("version", ValueKind::Map));
        assert!(!v.has("version/major", ValueKind::String));
        assert!(v.get("version/minor").is_none());
        assert!(v.get("version/major/deeper").is_none());
    }

    #[test]
    fn test_insert_ignored_on_leaf() {
        let mut v = Value::from("leaf");
        v.insert("k", 1i64);
        assert_eq!(v, Value::String("leaf".into()));
    }

    #[test]
    fn test_plain_json_bridge() {
        let plain = serde_json::json!({"n": 3, "x": 1.5, "l": [true, null], "s": "hi"});
        let v = Value::from(plain.clone());
        assert_eq!(v.get_i64("n"), Some(3));
        assert_eq!(v.get("x"), Some(&Value::Double(1.5)));
        assert_eq!(v.to_json(), plain);
        assert_eq!(Value::Callback(9).to_json(), serde_json::json!(9));
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".into()));
    }
}
