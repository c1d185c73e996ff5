//! Turns a path template plus JSON arguments into an [`HttpRequest`].

use serde_json::{Map, Value};
use url::form_urlencoded;

use crate::error::ApiError;
use crate::transport::{HttpRequest, Method};

/// Render `template` against `args`.
///
/// `{name}` placeholders are filled from `args` (a scalar argument fills a
/// template with exactly one placeholder). Arguments not consumed by the path
/// become the query string for GET/DELETE and the JSON body otherwise.
pub fn render(method: Method, template: &str, args: &Value) -> Result<HttpRequest, ApiError> {
  let placeholders = placeholders(template);

  let (path, leftover) = match args {
    Value::Object(map) => {
      let mut remaining = map.clone();
      let mut path = template.to_string();
      for name in &placeholders {
        let value = remaining
          .remove(name.as_str())
          .ok_or_else(|| ApiError::Serialization(format!("Missing path argument `{}` for {}", name, template)))?;
        path = path.replace(&format!("{{{}}}", name), &path_segment(&value)?);
      }
      (path, Some(Value::Object(remaining)))
    }
    Value::Null if placeholders.is_empty() => (template.to_string(), None),
    scalar if placeholders.len() == 1 => {
      let path = template.replace(&format!("{{{}}}", placeholders[0]), &path_segment(scalar)?);
      (path, None)
    }
    other if placeholders.is_empty() => (template.to_string(), Some(other.clone())),
    _ => {
      return Err(ApiError::Serialization(format!(
        "Template {} needs named arguments",
        template
      )))
    }
  };

  let mut request = HttpRequest::new(method, path);
  match leftover {
    Some(Value::Object(map)) if map.is_empty() => {}
    Some(Value::Object(map)) if method.uses_query_string() => {
      request.query = query_pairs(map);
    }
    Some(body) if !method.uses_query_string() => {
      request.body = Some(body);
    }
    Some(other) => {
      return Err(ApiError::Serialization(format!(
        "{:?} {} takes named arguments, got {}",
        method, template, other
      )))
    }
    None => {}
  }
  Ok(request)
}

fn placeholders(template: &str) -> Vec<String> {
  let mut names = Vec::new();
  let mut rest = template;
  while let Some(start) = rest.find('{') {
    let Some(len) = rest[start..].find('}') else {
      break;
    };
    names.push(rest[start + 1..start + len].to_string());
    rest = &rest[start + len + 1..];
  }
  names
}

fn scalar_to_string(value: &Value) -> Result<String, ApiError> {
  match value {
    Value::String(s) => Ok(s.clone()),
    Value::Number(n) => Ok(n.to_string()),
    Value::Bool(b) => Ok(b.to_string()),
    other => Err(ApiError::Serialization(format!(
      "Path argument must be a scalar, got {}",
      other
    ))),
  }
}

/// Percent-encode one path segment so an argument can never add segments,
/// walk up with `..`, or start a query string.
fn path_segment(value: &Value) -> Result<String, ApiError> {
  let raw = scalar_to_string(value)?;
  if raw.is_empty() || raw == "." || raw == ".." {
    return Err(ApiError::Serialization(format!(
      "Invalid path argument {:?}",
      raw
    )));
  }
  // byte_serialize writes spaces as `+`, which is literal in a path
  Ok(form_urlencoded::byte_serialize(raw.as_bytes()).collect::<String>().replace('+', "%20"))
}

fn query_pairs(map: Map<String, Value>) -> Vec<(String, String)> {
  map
    .into_iter()
    .filter(|(_, v)| !v.is_null())
    .map(|(k, v)| {
      let v = match v {
        Value::String(s) => s,
        other => other.to_string(),
      };
      (k, v)
    })
    .collect()
}
