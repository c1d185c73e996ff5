//! Tags label cache entries and mutations for invalidation.
//!
//! A tag is a resource type plus either the collection marker (`LIST`) or an
//! item id. Collection and item tags never match each other implicitly.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resource types known to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagType {
  Employee,
  Department,
  LeaveRequest,
  Attendance,
  ChatSession,
  ChatMessage,
  Notification,
}

impl TagType {
  pub fn as_str(&self) -> &'static str {
    match self {
      TagType::Employee => "Employee",
      TagType::Department => "Department",
      TagType::LeaveRequest => "LeaveRequest",
      TagType::Attendance => "Attendance",
      TagType::ChatSession => "ChatSession",
      TagType::ChatMessage => "ChatMessage",
      TagType::Notification => "Notification",
    }
  }
}

/// Collection marker or item identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
  List,
  Item(String),
}

impl TagId {
  /// Normalize a raw id: absent or `"LIST"` is the collection marker.
  pub fn parse(raw: Option<&str>) -> Self {
    match raw {
      None | Some("LIST") => TagId::List,
      Some(id) => TagId::Item(id.to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
  pub kind: TagType,
  pub id: TagId,
}

impl Tag {
  /// Collection-level tag, e.g. `Employee:LIST`.
  pub fn list(kind: TagType) -> Self {
    Self {
      kind,
      id: TagId::List,
    }
  }

  /// Item-level tag, e.g. `Employee:42`.
  pub fn item(kind: TagType, id: impl ToString) -> Self {
    Self {
      kind,
      id: TagId::parse(Some(&id.to_string())),
    }
  }

  /// Item tag from a JSON id (string or number). Other values yield `None`.
  pub fn from_value(kind: TagType, id: &Value) -> Option<Self> {
    match id {
      Value::String(s) => Some(Self::item(kind, s)),
      Value::Number(n) => Some(Self::item(kind, n)),
      _ => None,
    }
  }

  pub fn is_list(&self) -> bool {
    matches!(self.id, TagId::List)
  }
}

impl fmt::Display for Tag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.id {
      TagId::List => write!(f, "{}:LIST", self.kind.as_str()),
      TagId::Item(id) => write!(f, "{}:{}", self.kind.as_str(), id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_list_and_item_are_distinct() {
    let list = Tag::list(TagType::Employee);
    let item = Tag::item(TagType::Employee, 42);
    assert_ne!(list, item);
    assert!(list.is_list());
    assert!(!item.is_list());
  }

  #[test]
  fn test_list_literal_normalizes() {
    assert_eq!(Tag::item(TagType::Employee, "LIST"), Tag::list(TagType::Employee));
    assert_eq!(TagId::parse(None), TagId::List);
  }

  #[test]
  fn test_from_value() {
    assert_eq!(
      Tag::from_value(TagType::Employee, &serde_json::json!("e-1")),
      Some(Tag::item(TagType::Employee, "e-1"))
    );
    assert_eq!(
      Tag::from_value(TagType::Employee, &serde_json::json!(3)),
      Some(Tag::item(TagType::Employee, 3))
    );
    assert_eq!(Tag::from_value(TagType::Employee, &Value::Null), None);
  }

  #[test]
  fn test_display() {
    assert_eq!(Tag::list(TagType::LeaveRequest).to_string(), "LeaveRequest:LIST");
    assert_eq!(Tag::item(TagType::Employee, 7).to_string(), "Employee:7");
  }
}
