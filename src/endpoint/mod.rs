//! Endpoint registry: the static table of query and mutation descriptors.
//!
//! Descriptors are immutable and registered once. The runtime is generic over
//! them: it only ever calls [`QueryEndpoint::build_request`],
//! [`QueryEndpoint::transform`] and the tag functions.

mod table;
mod template;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::tag::Tag;
use crate::transport::{HttpRequest, Method};

pub use table::{EndpointSpec, EndpointTable, TagSpec};
pub use template::render;

pub type RequestFn = Arc<dyn Fn(&Value) -> Result<HttpRequest, ApiError> + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, ApiError> + Send + Sync>;
/// `(result, args) -> tags` provided by a query result.
pub type ProvidesFn = Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>;
/// `(args, result) -> tags` invalidated by a successful mutation.
pub type InvalidatesFn = Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>;

/// A read endpoint whose results are cached.
pub struct QueryEndpoint {
  id: String,
  request: RequestFn,
  transform: TransformFn,
  provides: ProvidesFn,
}

impl QueryEndpoint {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn build_request(&self, args: &Value) -> Result<HttpRequest, ApiError> {
    (self.request)(args)
  }

  pub fn transform(&self, raw: Value) -> Result<Value, ApiError> {
    (self.transform)(raw)
  }

  pub fn tags_provided(&self, result: &Value, args: &Value) -> Vec<Tag> {
    (self.provides)(result, args)
  }
}

/// A write endpoint whose success invalidates tags.
pub struct MutationEndpoint {
  id: String,
  request: RequestFn,
  transform: TransformFn,
  invalidates: InvalidatesFn,
}

impl MutationEndpoint {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn build_request(&self, args: &Value) -> Result<HttpRequest, ApiError> {
    (self.request)(args)
  }

  pub fn transform(&self, raw: Value) -> Result<Value, ApiError> {
    (self.transform)(raw)
  }

  pub fn tags_invalidated(&self, args: &Value, result: &Value) -> Vec<Tag> {
    (self.invalidates)(args, result)
  }
}

/// Tagged descriptor record.
#[derive(Clone)]
pub enum Endpoint {
  Query(Arc<QueryEndpoint>),
  Mutation(Arc<MutationEndpoint>),
}

impl Endpoint {
  /// Start a query descriptor (GET by default).
  pub fn query(id: impl Into<String>) -> EndpointBuilder {
    EndpointBuilder::new(id.into(), EndpointKind::Query, Method::Get)
  }

  /// Start a mutation descriptor (POST by default).
  pub fn mutation(id: impl Into<String>) -> EndpointBuilder {
    EndpointBuilder::new(id.into(), EndpointKind::Mutation, Method::Post)
  }

  pub fn id(&self) -> &str {
    match self {
      Endpoint::Query(q) => q.id(),
      Endpoint::Mutation(m) => m.id(),
    }
  }

  pub fn kind(&self) -> EndpointKind {
    match self {
      Endpoint::Query(_) => EndpointKind::Query,
      Endpoint::Mutation(_) => EndpointKind::Mutation,
    }
  }
}

impl fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
      .field("id", &self.id())
      .field("kind", &self.kind())
      .finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
  #[default]
  Query,
  Mutation,
}

impl fmt::Display for EndpointKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EndpointKind::Query => write!(f, "query"),
      EndpointKind::Mutation => write!(f, "mutation"),
    }
  }
}

/// Builder shared by both descriptor kinds.
pub struct EndpointBuilder {
  id: String,
  kind: EndpointKind,
  method: Method,
  path: String,
  request: Option<RequestFn>,
  transform: TransformFn,
  tags: Arc<dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync>,
}

impl EndpointBuilder {
  fn new(id: String, kind: EndpointKind, method: Method) -> Self {
    let path = format!("/{}", id);
    Self {
      id,
      kind,
      method,
      path,
      request: None,
      transform: Arc::new(|raw: Value| Ok(raw)),
      tags: Arc::new(|_: &Value, _: &Value| Vec::new()),
    }
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  /// Path template with `{arg}` placeholders.
  pub fn path(mut self, template: impl Into<String>) -> Self {
    self.path = template.into();
    self
  }

  /// Replace template rendering with a custom request builder.
  pub fn request<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value) -> Result<HttpRequest, ApiError> + Send + Sync + 'static,
  {
    self.request = Some(Arc::new(f));
    self
  }

  pub fn transform<F>(mut self, f: F) -> Self
  where
    F: Fn(Value) -> Result<Value, ApiError> + Send + Sync + 'static,
  {
    self.transform = Arc::new(f);
    self
  }

  /// Unwrap one field of the response envelope, e.g. `{"data": ...}`.
  pub fn result_field(self, field: impl Into<String>) -> Self {
    let field = field.into();
    self.transform(move |mut raw| match raw.get_mut(field.as_str()) {
      Some(inner) => Ok(inner.take()),
      None => Err(ApiError::Serialization(format!(
        "Response has no `{}` field",
        field
      ))),
    })
  }

  /// Tags provided by a query result, computed from `(result, args)`.
  pub fn provides<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.tags = Arc::new(f);
    self
  }

  /// Tags invalidated by a mutation, computed from `(args, result)`.
  pub fn invalidates<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
  {
    self.tags = Arc::new(f);
    self
  }

  /// Static tag list for either kind.
  pub fn tags(self, tags: Vec<Tag>) -> Self {
    let tags = Arc::new(tags);
    let f = move |_: &Value, _: &Value| tags.as_ref().clone();
    match self.kind {
      EndpointKind::Query => self.provides(f),
      EndpointKind::Mutation => self.invalidates(f),
    }
  }

  pub fn build(self) -> Endpoint {
    let request: RequestFn = match self.request {
      Some(request) => request,
      None => {
        let method = self.method;
        let path = self.path;
        Arc::new(move |args: &Value| render(method, &path, args))
      }
    };

    match self.kind {
      EndpointKind::Query => Endpoint::Query(Arc::new(QueryEndpoint {
        id: self.id,
        request,
        transform: self.transform,
        provides: self.tags,
      })),
      EndpointKind::Mutation => Endpoint::Mutation(Arc::new(MutationEndpoint {
        id: self.id,
        request,
        transform: self.transform,
        invalidates: self.tags,
      })),
    }
  }
}

/// The registered endpoint table, keyed by endpoint id.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
  endpoints: BTreeMap<String, Endpoint>,
}

impl EndpointRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a descriptor. Ids are unique; registering twice is an error.
  pub fn register(&mut self, endpoint: Endpoint) -> Result<(), ApiError> {
    let id = endpoint.id().to_string();
    if self.endpoints.contains_key(&id) {
      return Err(ApiError::Endpoint(format!("Endpoint `{}` registered twice", id)));
    }
    self.endpoints.insert(id, endpoint);
    Ok(())
  }

  pub fn with(mut self, endpoint: Endpoint) -> Result<Self, ApiError> {
    self.register(endpoint)?;
    Ok(self)
  }

  pub fn get(&self, id: &str) -> Option<&Endpoint> {
    self.endpoints.get(id)
  }

  pub fn query(&self, id: &str) -> Result<Arc<QueryEndpoint>, ApiError> {
    match self.endpoints.get(id) {
      Some(Endpoint::Query(q)) => Ok(Arc::clone(q)),
      Some(Endpoint::Mutation(_)) => Err(ApiError::Endpoint(format!("`{}` is a mutation, not a query", id))),
      None => Err(ApiError::Endpoint(format!("Unknown endpoint `{}`", id))),
    }
  }

  pub fn mutation(&self, id: &str) -> Result<Arc<MutationEndpoint>, ApiError> {
    match self.endpoints.get(id) {
      Some(Endpoint::Mutation(m)) => Ok(Arc::clone(m)),
      Some(Endpoint::Query(_)) => Err(ApiError::Endpoint(format!("`{}` is a query, not a mutation", id))),
      None => Err(ApiError::Endpoint(format!("Unknown endpoint `{}`", id))),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
    self.endpoints.values()
  }

  pub fn len(&self) -> usize {
    self.endpoints.len()
  }

  pub fn is_empty(&self) -> bool {
    self.endpoints.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tag::TagType;
  use serde_json::json;

  fn registry() -> EndpointRegistry {
    EndpointRegistry::new()
      .with(
        Endpoint::query("getEmployee")
          .path("/employees/{id}")
          .result_field("data")
          .provides(|_, args| Tag::from_value(TagType::Employee, &args["id"]).into_iter().collect())
          .build(),
      )
      .unwrap()
      .with(
        Endpoint::mutation("createEmployee")
          .path("/employees")
          .tags(vec![Tag::list(TagType::Employee)])
          .build(),
      )
      .unwrap()
  }

  #[test]
  fn test_lookup_by_kind() {
    let registry = registry();
    assert!(registry.query("getEmployee").is_ok());
    assert!(registry.mutation("createEmployee").is_ok());
    assert!(matches!(registry.mutation("getEmployee"), Err(ApiError::Endpoint(_))));
    assert!(matches!(registry.query("nope"), Err(ApiError::Endpoint(_))));
  }

  #[test]
  fn test_duplicate_registration_rejected() {
    let mut registry = registry();
    let err = registry.register(Endpoint::query("getEmployee").build());
    assert!(err.is_err());
    assert_eq!(registry.len(), 2);
  }

  #[test]
  fn test_query_descriptor_behaviour() {
    let query = registry().query("getEmployee").unwrap();
    let args = json!({ "id": 5 });

    let request = query.build_request(&args).unwrap();
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.path, "/employees/5");

    let value = query.transform(json!({ "data": { "id": 5 } })).unwrap();
    assert_eq!(value, json!({ "id": 5 }));
    assert!(query.transform(json!({ "id": 5 })).is_err());

    assert_eq!(
      query.tags_provided(&value, &args),
      vec![Tag::item(TagType::Employee, 5)]
    );
  }

  #[test]
  fn test_mutation_static_tags() {
    let mutation = registry().mutation("createEmployee").unwrap();
    let request = mutation.build_request(&json!({ "name": "Ada" })).unwrap();
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.body, Some(json!({ "name": "Ada" })));
    assert_eq!(
      mutation.tags_invalidated(&Value::Null, &Value::Null),
      vec![Tag::list(TagType::Employee)]
    );
  }
}
