//! # Tuple
//!
//! The record type that flows through pipes. A tuple carries a JSON object
//! payload plus the metadata the runtime stamps on it while it travels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single record flowing through the topology.
///
/// `input_name` is overwritten by every pipe the tuple passes through, so a
/// box always sees the name under which the tuple arrived at *its* input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
  /// Payload.
  pub data: Map<String, Value>,
  /// Input name of the pipe that delivered this tuple.
  pub input_name: String,
  /// Event time.
  pub timestamp: DateTime<Utc>,
  /// Time the tuple entered the topology.
  pub proc_timestamp: DateTime<Utc>,
  /// Batch identifier assigned by the producing source, 0 when unused.
  pub batch_id: u64,
}

impl Tuple {
  /// Creates a tuple stamped with the current time.
  pub fn new(data: Map<String, Value>) -> Self {
    let now = Utc::now();
    Self {
      data,
      input_name: String::new(),
      timestamp: now,
      proc_timestamp: now,
      batch_id: 0,
    }
  }

  /// Creates a tuple from a JSON value. Non-object values are stored under
  /// the `"value"` key.
  pub fn from_value(value: Value) -> Self {
    match value {
      Value::Object(map) => Self::new(map),
      other => {
        let mut map = Map::new();
        map.insert("value".to_string(), other);
        Self::new(map)
      }
    }
  }

  /// Returns the payload field `key`, if present.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.data.get(key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn from_value_wraps_scalars() {
    let t = Tuple::from_value(json!(42));
    assert_eq!(t.get("value"), Some(&json!(42)));
    assert!(t.input_name.is_empty());
  }

  #[test]
  fn from_value_keeps_objects() {
    let t = Tuple::from_value(json!({"a": 1, "b": "x"}));
    assert_eq!(t.get("a"), Some(&json!(1)));
    assert_eq!(t.get("b"), Some(&json!("x")));
    assert_eq!(t.timestamp, t.proc_timestamp);
  }
}
