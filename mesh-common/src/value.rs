use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The dynamic-typing boundary value (§9 "Dynamic typing on the boundary").
///
/// Script payloads cross the RPC and gossip boundary as JSON. Rather than
/// leaking an interpreter-specific value representation into the wire
/// formats, every boundary marshals through this sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Encode to the JSON bytes carried in an RPC request/response body.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"null".to_vec())
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
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

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Number(1.0));
        map.insert("b".to_string(), Value::Array(vec![Value::Bool(true), Value::Null]));
        let v = Value::Map(map);
        let bytes = v.to_json_bytes();
        let back = Value::from_json_bytes(&bytes);
        assert_eq!(v, back);
    }

    #[test]
    fn malformed_bytes_decode_to_null() {
        assert_eq!(Value::from_json_bytes(b"{not json"), Value::Null);
    }
}
