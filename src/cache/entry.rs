//! Cache entry state and the patch type used to change it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use super::key::CacheKey;
use crate::error::ApiError;
use crate::tag::Tag;

/// Lifecycle of a cache entry.
///
/// `Uninitialized -> Pending -> {Fulfilled, Rejected} -> Pending -> ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  Uninitialized,
  Pending,
  Fulfilled,
  Rejected,
}

impl QueryStatus {
  pub fn can_transition_to(self, next: QueryStatus) -> bool {
    use QueryStatus::*;
    match (self, next) {
      (a, b) if a == b => true,
      (Uninitialized, Pending) => true,
      (Pending, Fulfilled) | (Pending, Rejected) => true,
      (Fulfilled, Pending) | (Rejected, Pending) => true,
      _ => false,
    }
  }
}

/// The endpoint and arguments an entry was created for, so any component
/// holding only a key can refetch it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOrigin {
  pub endpoint: String,
  pub args: Value,
}

/// A snapshot of one cache entry. The live entry is only reachable through
/// [`CacheStore`](super::CacheStore) methods.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub origin: QueryOrigin,
  pub status: QueryStatus,
  pub value: Option<Value>,
  pub error: Option<ApiError>,
  pub last_fetched_at: Option<DateTime<Utc>>,
  /// Effective poll interval (minimum over polling subscribers)
  pub poll_interval: Option<Duration>,
  pub subscriber_count: usize,
  pub tags_provided: Vec<Tag>,
  /// Set by invalidation, cleared by the next successful fetch issued after it
  pub stale: bool,
  /// `request_seq` at the last invalidation; responses to requests issued
  /// up to this point predate it and leave the entry stale
  pub stale_since_seq: u64,
  /// Sequence number of the most recently issued request
  pub request_seq: u64,
  /// Sequence number of the request whose result was last written
  pub applied_seq: u64,
  pub(crate) unused_since: Option<Instant>,
}

impl CacheEntry {
  pub(crate) fn new(key: CacheKey, origin: QueryOrigin) -> Self {
    Self {
      key,
      origin,
      status: QueryStatus::Uninitialized,
      value: None,
      error: None,
      last_fetched_at: None,
      poll_interval: None,
      subscriber_count: 0,
      tags_provided: Vec::new(),
      stale: false,
      stale_since_seq: 0,
      request_seq: 0,
      applied_seq: 0,
      unused_since: Some(Instant::now()),
    }
  }

  /// Whether the cached value can be served without a network call.
  pub fn is_fresh(&self, stale_time: Option<Duration>) -> bool {
    if self.status != QueryStatus::Fulfilled || self.stale {
      return false;
    }
    match (stale_time, self.last_fetched_at) {
      (None, _) => true,
      (Some(max_age), Some(fetched_at)) => chrono::Duration::from_std(max_age)
        .map(|max_age| Utc::now() - fetched_at <= max_age)
        .unwrap_or(true),
      (Some(_), None) => false,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Fulfilled
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Rejected
  }
}

/// A partial update applied by [`CacheStore::upsert`](super::CacheStore::upsert).
///
/// Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
  pub(crate) origin: Option<QueryOrigin>,
  pub(crate) status: Option<QueryStatus>,
  pub(crate) value: Option<Option<Value>>,
  pub(crate) error: Option<Option<ApiError>>,
  pub(crate) tags: Option<Vec<Tag>>,
  pub(crate) stale: Option<bool>,
  pub(crate) last_fetched_at: Option<DateTime<Utc>>,
  pub(crate) poll_interval: Option<Option<Duration>>,
}

impl EntryPatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Required when the patch may create the entry.
  pub fn origin(mut self, origin: QueryOrigin) -> Self {
    self.origin = Some(origin);
    self
  }

  pub fn status(mut self, status: QueryStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn value(mut self, value: Option<Value>) -> Self {
    self.value = Some(value);
    self
  }

  pub fn error(mut self, error: Option<ApiError>) -> Self {
    self.error = Some(error);
    self
  }

  pub fn tags(mut self, tags: Vec<Tag>) -> Self {
    self.tags = Some(tags);
    self
  }

  pub fn stale(mut self, stale: bool) -> Self {
    self.stale = Some(stale);
    self
  }

  pub fn fetched_at(mut self, at: DateTime<Utc>) -> Self {
    self.last_fetched_at = Some(at);
    self
  }

  pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
    self.poll_interval = Some(interval);
    self
  }
}
