//! Error taxonomy shared by queries, mutations and the auth interceptor.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced to callers of the query and mutation APIs.
///
/// The type is `Clone` because a single coalesced request hands the same
/// result to every attached waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
  /// Transport failure, no response was received.
  #[error("Network error: {0}")]
  Network(String),

  /// The server answered 401.
  #[error("Not authenticated: {message}")]
  Auth { message: String },

  /// Any 4xx other than 401, with the server's field errors.
  #[error("Request rejected ({status}): {message}")]
  Validation {
    status: u16,
    message: String,
    field_errors: BTreeMap<String, Vec<String>>,
  },

  /// 5xx, or any other unexpected status.
  #[error("Server error ({status}): {message}")]
  Server { status: u16, message: String },

  /// Arguments or payloads that could not be encoded or transformed locally.
  #[error("Serialization error: {0}")]
  Serialization(String),

  /// Unknown endpoint id, or an endpoint used as the wrong kind.
  #[error("Endpoint error: {0}")]
  Endpoint(String),
}

impl ApiError {
  /// Classify a non-2xx response into the taxonomy.
  pub fn from_status(status: u16, body: &Value) -> Self {
    let message = extract_message(body).unwrap_or_else(|| format!("HTTP {}", status));
    match status {
      401 => ApiError::Auth { message },
      400..=499 => ApiError::Validation {
        status,
        message,
        field_errors: extract_field_errors(body),
      },
      _ => ApiError::Server { status, message },
    }
  }

  pub fn is_auth(&self) -> bool {
    matches!(self, ApiError::Auth { .. })
  }

  /// HTTP status carried by the error, if it came from a response.
  pub fn status(&self) -> Option<u16> {
    match self {
      ApiError::Auth { .. } => Some(401),
      ApiError::Validation { status, .. } | ApiError::Server { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn field_errors(&self) -> Option<&BTreeMap<String, Vec<String>>> {
    match self {
      ApiError::Validation { field_errors, .. } => Some(field_errors),
      _ => None,
    }
  }
}

impl From<serde_json::Error> for ApiError {
  fn from(e: serde_json::Error) -> Self {
    ApiError::Serialization(e.to_string())
  }
}

fn extract_message(body: &Value) -> Option<String> {
  match body {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Object(map) => ["message", "error", "detail"]
      .iter()
      .find_map(|field| map.get(*field).and_then(Value::as_str))
      .map(String::from),
    _ => None,
  }
}

/// Read `errors` as `{ field: "msg" | ["msg", ...] }`.
fn extract_field_errors(body: &Value) -> BTreeMap<String, Vec<String>> {
  let Some(errors) = body.get("errors").and_then(Value::as_object) else {
    return BTreeMap::new();
  };

  errors
    .iter()
    .map(|(field, messages)| {
      let messages = match messages {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
          .iter()
          .map(|m| m.as_str().map(String::from).unwrap_or_else(|| m.to_string()))
          .collect(),
        other => vec![other.to_string()],
      };
      (field.clone(), messages)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_classify_auth() {
    let err = ApiError::from_status(401, &json!({ "message": "token expired" }));
    assert!(err.is_auth());
    assert_eq!(err.status(), Some(401));
    assert_eq!(err.to_string(), "Not authenticated: token expired");
  }

  #[test]
  fn test_classify_validation_with_field_errors() {
    let body = json!({
      "message": "Invalid leave request",
      "errors": {
        "start_date": ["must be in the future"],
        "reason": "is required"
      }
    });
    let err = ApiError::from_status(422, &body);

    let fields = err.field_errors().expect("validation error");
    assert_eq!(fields["start_date"], vec!["must be in the future".to_string()]);
    assert_eq!(fields["reason"], vec!["is required".to_string()]);
    assert_eq!(err.status(), Some(422));
  }

  #[test]
  fn test_classify_server() {
    let err = ApiError::from_status(503, &Value::Null);
    assert_eq!(
      err,
      ApiError::Server {
        status: 503,
        message: "HTTP 503".to_string()
      }
    );
  }

  #[test]
  fn test_plain_text_body_becomes_message() {
    let err = ApiError::from_status(500, &json!("upstream timeout"));
    assert_eq!(err.to_string(), "Server error (500): upstream timeout");
  }
}
