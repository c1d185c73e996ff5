//! Cache keys derived from an endpoint id and its arguments.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic key for one `(endpoint, args)` pair.
///
/// Arguments are hashed over their canonical JSON form: object keys are
/// sorted recursively, so structurally equal arguments collide regardless of
/// property order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  endpoint: String,
  args_hash: String,
}

impl CacheKey {
  pub fn new(endpoint: &str, args: &Value) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(args).as_bytes());
    let digest = hasher.finalize();

    Self {
      endpoint: endpoint.to_string(),
      args_hash: hex::encode(digest),
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}({})", self.endpoint, self.args_hash)
  }
}

/// Serialize with object keys in sorted order at every depth.
pub fn canonical_json(value: &Value) -> String {
  match value {
    Value::Object(map) => {
      let mut fields: Vec<(&String, &Value)> = map.iter().collect();
      fields.sort_by(|a, b| a.0.cmp(b.0));
      let body: Vec<String> = fields
        .into_iter()
        .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
        .collect();
      format!("{{{}}}", body.join(","))
    }
    Value::Array(items) => {
      let body: Vec<String> = items.iter().map(canonical_json).collect();
      format!("[{}]", body.join(","))
    }
    scalar => scalar.to_string(),
  }
}
