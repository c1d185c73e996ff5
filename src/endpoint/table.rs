//! Declarative endpoint table, loaded from YAML.
//!
//! ```yaml
//! endpoints:
//!   - id: listEmployees
//!     path: /employees
//!     result_field: data
//!     provides:
//!       - { type: Employee, id: LIST }
//!       - { type: Employee, from_result: id }
//!   - id: updateEmployee
//!     kind: mutation
//!     method: PUT
//!     path: /employees/{id}
//!     invalidates:
//!       - { type: Employee, id: "{id}" }
//!       - { type: Employee, id: LIST }
//! ```

use serde::Deserialize;
use serde_json::Value;

use super::{Endpoint, EndpointKind, EndpointRegistry};
use crate::error::ApiError;
use crate::tag::{Tag, TagType};
use crate::transport::Method;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointTable {
  #[serde(default)]
  pub endpoints: Vec<EndpointSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSpec {
  pub id: String,
  #[serde(default)]
  pub kind: EndpointKind,
  /// Defaults to GET for queries and POST for mutations
  pub method: Option<Method>,
  pub path: String,
  pub result_field: Option<String>,
  #[serde(default)]
  pub provides: Vec<TagSpec>,
  #[serde(default)]
  pub invalidates: Vec<TagSpec>,
}

/// One tag declaration.
///
/// `id` is absent or `LIST` for the collection tag, `{arg}` to read the id
/// from the arguments, or a literal. `from_result` emits one item tag per
/// element of an array result (or one for an object result).
#[derive(Debug, Clone, Deserialize)]
pub struct TagSpec {
  #[serde(rename = "type")]
  pub kind: TagType,
  pub id: Option<String>,
  pub from_result: Option<String>,
}

impl TagSpec {
  pub fn resolve(&self, result: &Value, args: &Value) -> Vec<Tag> {
    if let Some(field) = &self.from_result {
      return match result {
        Value::Array(items) => items
          .iter()
          .filter_map(|item| item.get(field.as_str()))
          .filter_map(|id| Tag::from_value(self.kind, id))
          .collect(),
        Value::Object(map) => map
          .get(field.as_str())
          .and_then(|id| Tag::from_value(self.kind, id))
          .into_iter()
          .collect(),
        _ => Vec::new(),
      };
    }

    match self.id.as_deref() {
      None | Some("LIST") => vec![Tag::list(self.kind)],
      Some(raw) if raw.starts_with('{') && raw.ends_with('}') => {
        let name = &raw[1..raw.len() - 1];
        let value = match args {
          Value::Object(map) => map.get(name),
          scalar => Some(scalar),
        };
        value
          .and_then(|id| Tag::from_value(self.kind, id))
          .into_iter()
          .collect()
      }
      Some(literal) => vec![Tag::item(self.kind, literal)],
    }
  }
}

fn resolve_all(specs: &[TagSpec], result: &Value, args: &Value) -> Vec<Tag> {
  specs.iter().flat_map(|spec| spec.resolve(result, args)).collect()
}

impl EndpointSpec {
  pub fn into_endpoint(self) -> Result<Endpoint, ApiError> {
    let mut builder = match self.kind {
      EndpointKind::Query => {
        if !self.invalidates.is_empty() {
          return Err(ApiError::Endpoint(format!(
            "Query `{}` cannot declare `invalidates`",
            self.id
          )));
        }
        let provides = self.provides;
        Endpoint::query(self.id).provides(move |result, args| resolve_all(&provides, result, args))
      }
      EndpointKind::Mutation => {
        if !self.provides.is_empty() {
          return Err(ApiError::Endpoint(format!(
            "Mutation `{}` cannot declare `provides`",
            self.id
          )));
        }
        let invalidates = self.invalidates;
        Endpoint::mutation(self.id)
          .invalidates(move |args, result| resolve_all(&invalidates, result, args))
      }
    };

    builder = builder.path(self.path);
    if let Some(method) = self.method {
      builder = builder.method(method);
    }
    if let Some(field) = self.result_field {
      builder = builder.result_field(field);
    }
    Ok(builder.build())
  }
}

impl EndpointTable {
  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn into_registry(self) -> Result<EndpointRegistry, ApiError> {
    let mut registry = EndpointRegistry::new();
    for spec in self.endpoints {
      registry.register(spec.into_endpoint()?)?;
    }
    Ok(registry)
  }
}
