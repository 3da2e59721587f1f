#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Digest;
use std::collections::BTreeMap;
use std::fmt::Write;

/// String keys shorter than this are used verbatim as their own hash.
const RAW_KEY_MAX_LEN: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryKeyValue {
    Text(String),
    Sql(String, Vec<Value>),
}

/// Identity of a submittable unit of work.
///
/// Persistent keys (scheduled refreshes and the like) are exempt from the orphan sweep and are
/// suffixed with the owning process uid when hashed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryKey {
    pub value: QueryKeyValue,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persistent: bool,
}

impl QueryKey {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: QueryKeyValue::Text(value.into()),
            persistent: false,
        }
    }

    pub fn sql(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            value: QueryKeyValue::Sql(sql.into(), params),
            persistent: false,
        }
    }

    pub fn into_persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Canonical JSON of the key value. Object keys are sorted at every depth, whatever
    /// order the `Map` backing `serde_json::Value` keeps.
    pub fn canonical_json(&self) -> String {
        let value = match &self.value {
            QueryKeyValue::Text(text) => Value::String(text.clone()),
            QueryKeyValue::Sql(sql, params) => Value::Array(vec![
                Value::String(sql.clone()),
                Value::Array(params.iter().map(sorted_value).collect()),
            ]),
        };
        value.to_string()
    }
}

fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted = map
                .iter()
                .map(|(key, value)| (key.clone(), sorted_value(value)))
                .collect::<BTreeMap<_, _>>();
            Value::Object(sorted.into_iter().collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKeyHash(String);

impl QueryKeyHash {
    pub fn of(key: &QueryKey, process_uid: &str) -> Self {
        let base = match &key.value {
            QueryKeyValue::Text(text) if text.len() < RAW_KEY_MAX_LEN => text.clone(),
            _ => sha256_hex(key.canonical_json().as_bytes()),
        };
        if key.persistent {
            Self(format!("{base}@{process_uid}"))
        } else {
            Self(base)
        }
    }

    /// Wraps a hash read back from the store.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Process uid a persistent hash was minted by.
    pub fn owner_process(&self) -> Option<&str> {
        self.0.rsplit_once('@').map(|(_, uid)| uid)
    }
}

impl std::fmt::Display for QueryKeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_text_keys_hash_to_themselves() {
        let key = QueryKey::text("SELECT 1");
        assert_eq!(QueryKeyHash::of(&key, "p1").as_str(), "SELECT 1");
    }

    #[test]
    fn long_text_keys_are_digested() {
        let key = QueryKey::text("x".repeat(300));
        let hash = QueryKeyHash::of(&key, "p1");
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sql_keys_are_deterministic_across_param_key_order() {
        let a = QueryKey::sql("SELECT ?", vec![json!({"a": 1, "b": 2})]);
        let b = QueryKey::sql("SELECT ?", vec![json!({"b": 2, "a": 1})]);
        assert_eq!(QueryKeyHash::of(&a, "p"), QueryKeyHash::of(&b, "p"));

        let nested_a = QueryKey::sql("SELECT ?", vec![json!([{"x": {"q": 1, "p": 2}, "y": 0}])]);
        let nested_b = QueryKey::sql("SELECT ?", vec![json!([{"y": 0, "x": {"p": 2, "q": 1}}])]);
        assert_eq!(nested_a.canonical_json(), nested_b.canonical_json());
        assert_eq!(
            nested_a.canonical_json(),
            r#"["SELECT ?",[[{"x":{"p":2,"q":1},"y":0}]]]"#
        );

        let c = QueryKey::sql("SELECT ?", vec![json!(2)]);
        assert_ne!(QueryKeyHash::of(&a, "p"), QueryKeyHash::of(&c, "p"));
    }

    #[test]
    fn persistent_keys_carry_owner_process() {
        let key = QueryKey::text("refresh").into_persistent();
        let hash = QueryKeyHash::of(&key, "proc-7");
        assert_eq!(hash.as_str(), "refresh@proc-7");
        assert_eq!(hash.owner_process(), Some("proc-7"));
    }

    #[test]
    fn sql_key_wire_shape_is_a_pair() {
        let key = QueryKey::sql("SELECT ?", vec![json!(1)]);
        let encoded = serde_json::to_value(&key).expect("encode");
        assert_eq!(encoded, json!({"value": ["SELECT ?", [1]]}));
    }
}
