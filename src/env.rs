//! The per-iteration variable environment.

use crate::value::Value;
use std::collections::BTreeMap;

/// Flat `name -> value` map. Keys may themselves contain dots (CSV columns
/// live under `data.<source>.<tag>`), and lookups also navigate into map
/// and list values, so `user.address.0` resolves against a captured `user`
/// object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Env {
    vars: BTreeMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, Value)>) {
        self.vars.extend(other);
    }

    /// Exact key first, then the longest stored prefix followed by a path
    /// into that value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.vars.get(key) {
            return Some(v);
        }
        let mut end = key.len();
        while let Some(idx) = key[..end].rfind('.') {
            if let Some(head) = self.vars.get(&key[..idx]) {
                if let Some(v) = head.get_path(&key[idx + 1..]) {
                    return Some(v);
                }
            }
            end = idx;
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// The whole environment as one map value (`variables` in assertions).
    pub fn to_value(&self) -> Value {
        Value::Map(self.vars.clone())
    }
}

impl FromIterator<(String, Value)> for Env {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
