//! The cache store: single owner of every cache entry and of the tag index.
//!
//! All bookkeeping happens under one lock with no await points inside, so an
//! entry and its tag index buckets are always observed in agreement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryPatch, QueryOrigin, QueryStatus};
use super::key::CacheKey;
use super::tag_index::TagIndex;
use crate::error::ApiError;
use crate::tag::Tag;

pub type SubscriberId = u64;

const EVENT_CAPACITY: usize = 256;

/// Result of a settled network request, as written by the executor.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  Fulfilled { value: Value, tags: Vec<Tag> },
  Rejected(ApiError),
}

#[derive(Default)]
struct StoreState {
  entries: HashMap<CacheKey, CacheEntry>,
  tags: TagIndex,
  next_subscriber: SubscriberId,
}

pub struct CacheStore {
  state: Mutex<StoreState>,
  events: broadcast::Sender<CacheKey>,
}

impl Default for CacheStore {
  fn default() -> Self {
    Self::new()
  }
}

impl CacheStore {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      state: Mutex::new(StoreState::default()),
      events,
    }
  }

  fn lock(&self) -> MutexGuard<'_, StoreState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(&self, key: &CacheKey) {
    // No receivers is fine
    let _ = self.events.send(key.clone());
  }

  /// Receive the key of every entry written from now on.
  pub fn listen(&self) -> broadcast::Receiver<CacheKey> {
    self.events.subscribe()
  }

  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().entries.get(key).cloned()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().entries.contains_key(key)
  }

  pub fn keys(&self) -> Vec<CacheKey> {
    let mut keys: Vec<CacheKey> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self
      .lock()
      .entries
      .get(key)
      .map(|e| e.subscriber_count)
      .unwrap_or(0)
  }

  /// Apply `patch` to the entry, creating it when the patch carries an
  /// origin. Returns `false` if nothing was written.
  pub fn upsert(&self, key: &CacheKey, patch: EntryPatch) -> bool {
    let mut state = self.lock();
    if !state.entries.contains_key(key) {
      let Some(origin) = patch.origin.clone() else {
        return false;
      };
      state.entries.insert(key.clone(), CacheEntry::new(key.clone(), origin));
    }

    let written = apply_patch(&mut state, key, patch);
    drop(state);
    if written {
      self.notify(key);
    }
    written
  }

  /// Register a subscriber, creating the entry on first subscription.
  pub fn subscribe(self: &Arc<Self>, key: &CacheKey, origin: QueryOrigin) -> StoreSubscription {
    let mut state = self.lock();
    state.next_subscriber += 1;
    let id = state.next_subscriber;

    let entry = state
      .entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(key.clone(), origin));
    entry.subscriber_count += 1;
    entry.unused_since = None;

    StoreSubscription {
      store: Arc::clone(self),
      key: key.clone(),
      id,
      released: AtomicBool::new(false),
    }
  }

  /// Drop one subscriber. Returns the remaining count.
  fn release(&self, key: &CacheKey) -> Option<usize> {
    let mut state = self.lock();
    let entry = state.entries.get_mut(key)?;
    entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
    if entry.subscriber_count == 0 {
      entry.unused_since = Some(Instant::now());
    }
    Some(entry.subscriber_count)
  }

  /// Remove the entry if it has had no subscriber for at least `grace` and
  /// no request is pending for it.
  pub fn evict_if_unused(&self, key: &CacheKey, grace: Duration) -> bool {
    let mut state = self.lock();
    let eligible = state.entries.get(key).is_some_and(|entry| {
      entry.subscriber_count == 0
        && entry.status != QueryStatus::Pending
        && entry
          .unused_since
          .is_some_and(|since| since.elapsed() >= grace)
    });
    if !eligible {
      return false;
    }

    if let Some(entry) = state.entries.remove(key) {
      state.tags.remove(key, &entry.tags_provided);
    }
    drop(state);

    debug!(key = %key, "Evicted unused cache entry");
    self.notify(key);
    true
  }

  /// Evict every eligible entry. Returns the evicted keys.
  pub fn collect_garbage(&self, grace: Duration) -> Vec<CacheKey> {
    self
      .keys()
      .into_iter()
      .filter(|key| self.evict_if_unused(key, grace))
      .collect()
  }

  /// Keys of entries providing any of `tags`.
  pub fn keys_for_tags(&self, tags: &[Tag]) -> Vec<CacheKey> {
    self.lock().tags.lookup(tags).into_iter().collect()
  }

  /// Mark the entry stale. Requests already issued for it cannot clear the
  /// flag; only a response to a later request can.
  pub fn mark_stale(&self, key: &CacheKey) -> bool {
    let mut state = self.lock();
    let Some(entry) = state.entries.get_mut(key) else {
      return false;
    };
    entry.stale = true;
    entry.stale_since_seq = entry.request_seq;
    drop(state);

    self.notify(key);
    true
  }

  /// Move the entry to `Pending` and allocate the next request sequence
  /// number. Returns the sequence number and the entry's origin.
  pub fn begin_fetch(&self, key: &CacheKey) -> Option<(u64, QueryOrigin)> {
    let mut state = self.lock();
    let entry = state.entries.get_mut(key)?;
    entry.status = QueryStatus::Pending;
    entry.request_seq += 1;
    let started = (entry.request_seq, entry.origin.clone());
    drop(state);

    self.notify(key);
    Some(started)
  }

  /// Write a settled request. Responses older than the last applied one are
  /// discarded. Returns `true` if the outcome was written.
  pub fn complete_fetch(&self, key: &CacheKey, seq: u64, outcome: FetchOutcome) -> bool {
    let mut state = self.lock();
    let Some(entry) = state.entries.get(key) else {
      debug!(key = %key, seq, "Entry evicted before response arrived");
      return false;
    };
    if seq < entry.applied_seq {
      debug!(key = %key, seq, applied = entry.applied_seq, "Discarding superseded response");
      return false;
    }
    // A newer request is still in flight: keep the entry pending.
    let latest = seq == entry.request_seq;
    // Issued before the last invalidation: the value may predate the write.
    let keep_stale = entry.stale && seq <= entry.stale_since_seq;

    let patch = match outcome {
      FetchOutcome::Fulfilled { value, tags } => EntryPatch::new()
        .status(if latest { QueryStatus::Fulfilled } else { QueryStatus::Pending })
        .value(Some(value))
        .error(None)
        .tags(tags)
        .stale(keep_stale)
        .fetched_at(Utc::now()),
      FetchOutcome::Rejected(error) => EntryPatch::new()
        .status(if latest { QueryStatus::Rejected } else { QueryStatus::Pending })
        .error(Some(error)),
    };

    let written = apply_patch(&mut state, key, patch);
    if let Some(entry) = state.entries.get_mut(key) {
      entry.applied_seq = seq;
    }
    drop(state);

    if written {
      self.notify(key);
    }
    written
  }

  /// Edit the cached value in place. Returns the previous value, or `None`
  /// when the entry has no value to edit.
  pub fn patch_value<F>(&self, key: &CacheKey, recipe: F) -> Option<Value>
  where
    F: FnOnce(&mut Value),
  {
    let mut state = self.lock();
    let previous = state.entries.get(key)?.value.clone()?;
    let mut next = previous.clone();
    recipe(&mut next);
    apply_patch(&mut state, key, EntryPatch::new().value(Some(next)));
    drop(state);

    self.notify(key);
    Some(previous)
  }
}

/// Write `patch` into an existing entry, keeping the tag index in step.
fn apply_patch(state: &mut StoreState, key: &CacheKey, patch: EntryPatch) -> bool {
  let StoreState { entries, tags, .. } = state;
  let Some(entry) = entries.get_mut(key) else {
    return false;
  };

  if let Some(next) = patch.status {
    if !entry.status.can_transition_to(next) {
      warn!(key = %key, from = ?entry.status, to = ?next, "Rejected invalid status transition");
      return false;
    }
    entry.status = next;
  }
  if let Some(value) = patch.value {
    entry.value = value;
  }
  if let Some(error) = patch.error {
    entry.error = error;
  }
  if let Some(stale) = patch.stale {
    entry.stale = stale;
  }
  if let Some(at) = patch.last_fetched_at {
    entry.last_fetched_at = Some(at);
  }
  if let Some(interval) = patch.poll_interval {
    entry.poll_interval = interval;
  }
  if let Some(new_tags) = patch.tags {
    tags.replace(key, &entry.tags_provided, &new_tags);
    entry.tags_provided = new_tags;
  }
  true
}

/// Disposer returned by [`CacheStore::subscribe`].
///
/// Disposing is idempotent; dropping disposes.
pub struct StoreSubscription {
  store: Arc<CacheStore>,
  key: CacheKey,
  id: SubscriberId,
  released: AtomicBool,
}

impl StoreSubscription {
  pub fn id(&self) -> SubscriberId {
    self.id
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn is_disposed(&self) -> bool {
    self.released.load(Ordering::SeqCst)
  }

  /// Release this subscriber. Returns the remaining subscriber count the
  /// first time, `None` on every later call.
  pub fn dispose(&self) -> Option<usize> {
    if self.released.swap(true, Ordering::SeqCst) {
      return None;
    }
    self.store.release(&self.key)
  }
}

impl Drop for StoreSubscription {
  fn drop(&mut self) {
    self.dispose();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tag::TagType;
  use serde_json::json;

  fn origin(endpoint: &str, args: Value) -> QueryOrigin {
    QueryOrigin {
      endpoint: endpoint.to_string(),
      args,
    }
  }

  fn store_with(endpoint: &str, args: Value) -> (Arc<CacheStore>, CacheKey, StoreSubscription) {
    let store = Arc::new(CacheStore::new());
    let key = CacheKey::new(endpoint, &args);
    let sub = store.subscribe(&key, origin(endpoint, args));
    (store, key, sub)
  }

  #[test]
  fn test_upsert_without_origin_does_not_create() {
    let store = CacheStore::new();
    let key = CacheKey::new("listEmployees", &Value::Null);
    assert!(!store.upsert(&key, EntryPatch::new().stale(true)));
    assert!(store.is_empty());

    assert!(store.upsert(
      &key,
      EntryPatch::new().origin(origin("listEmployees", Value::Null))
    ));
    assert_eq!(store.get(&key).unwrap().status, QueryStatus::Uninitialized);
  }

  #[test]
  fn test_upsert_updates_tag_index_with_entry() {
    let (store, key, _sub) = store_with("getEmployee", json!({ "id": 1 }));
    let first = vec![Tag::item(TagType::Employee, 1), Tag::list(TagType::Department)];
    store.upsert(&key, EntryPatch::new().tags(first.clone()));
    assert_eq!(store.keys_for_tags(&[Tag::list(TagType::Department)]), vec![key.clone()]);

    store.upsert(&key, EntryPatch::new().tags(vec![Tag::item(TagType::Employee, 1)]));
    assert!(store.keys_for_tags(&[Tag::list(TagType::Department)]).is_empty());
    assert_eq!(store.get(&key).unwrap().tags_provided, vec![Tag::item(TagType::Employee, 1)]);
  }

  #[test]
  fn test_invalid_transition_is_rejected() {
    let (store, key, _sub) = store_with("listEmployees", Value::Null);
    let (seq, _) = store.begin_fetch(&key).unwrap();
    store.complete_fetch(
      &key,
      seq,
      FetchOutcome::Fulfilled {
        value: json!([]),
        tags: vec![],
      },
    );

    assert!(!store.upsert(&key, EntryPatch::new().status(QueryStatus::Uninitialized)));
    assert_eq!(store.get(&key).unwrap().status, QueryStatus::Fulfilled);
  }

  #[test]
  fn test_dispose_is_idempotent() {
    let (store, key, sub) = store_with("listEmployees", Value::Null);
    let second = store.subscribe(&key, origin("listEmployees", Value::Null));
    assert_eq!(store.subscriber_count(&key), 2);

    assert_eq!(sub.dispose(), Some(1));
    assert_eq!(sub.dispose(), None);
    assert_eq!(store.subscriber_count(&key), 1);

    drop(second);
    assert_eq!(store.subscriber_count(&key), 0);
    drop(sub);
    assert_eq!(store.subscriber_count(&key), 0);
  }

  #[test]
  fn test_evict_requires_no_subscribers_and_removes_tags() {
    let (store, key, sub) = store_with("listNotifications", Value::Null);
    let (seq, _) = store.begin_fetch(&key).unwrap();
    store.complete_fetch(
      &key,
      seq,
      FetchOutcome::Fulfilled {
        value: json!([]),
        tags: vec![Tag::list(TagType::Notification)],
      },
    );

    assert!(!store.evict_if_unused(&key, Duration::ZERO));
    sub.dispose();
    assert!(store.evict_if_unused(&key, Duration::ZERO));
    assert!(store.get(&key).is_none());
    assert!(store.keys_for_tags(&[Tag::list(TagType::Notification)]).is_empty());
  }

  #[test]
  fn test_pending_entries_are_not_evicted() {
    let (store, key, sub) = store_with("listNotifications", Value::Null);
    store.begin_fetch(&key).unwrap();
    sub.dispose();
    assert!(!store.evict_if_unused(&key, Duration::ZERO));
    assert!(store.collect_garbage(Duration::ZERO).is_empty());
  }

  #[test]
  fn test_grace_period_is_respected() {
    let (store, key, sub) = store_with("listNotifications", Value::Null);
    sub.dispose();
    assert!(!store.evict_if_unused(&key, Duration::from_secs(3600)));
    assert!(store.contains(&key));
  }

  #[test]
  fn test_superseded_response_is_discarded() {
    let (store, key, _sub) = store_with("getEmployee", json!({ "id": 9 }));
    let (first, _) = store.begin_fetch(&key).unwrap();
    let (second, _) = store.begin_fetch(&key).unwrap();

    let fulfilled = |v: i64| FetchOutcome::Fulfilled {
      value: json!({ "v": v }),
      tags: vec![],
    };
    assert!(store.complete_fetch(&key, second, fulfilled(2)));
    assert!(!store.complete_fetch(&key, first, fulfilled(1)));

    let entry = store.get(&key).unwrap();
    assert_eq!(entry.value, Some(json!({ "v": 2 })));
    assert_eq!(entry.status, QueryStatus::Fulfilled);
  }

  #[test]
  fn test_older_response_keeps_entry_pending() {
    let (store, key, _sub) = store_with("getEmployee", json!({ "id": 9 }));
    let (first, _) = store.begin_fetch(&key).unwrap();
    let (_second, _) = store.begin_fetch(&key).unwrap();

    store.complete_fetch(
      &key,
      first,
      FetchOutcome::Fulfilled {
        value: json!(1),
        tags: vec![],
      },
    );
    let entry = store.get(&key).unwrap();
    assert_eq!(entry.status, QueryStatus::Pending);
    assert_eq!(entry.value, Some(json!(1)));
  }

  #[test]
  fn test_rejection_keeps_previous_value() {
    let (store, key, _sub) = store_with("listEmployees", Value::Null);
    let (seq, _) = store.begin_fetch(&key).unwrap();
    store.complete_fetch(
      &key,
      seq,
      FetchOutcome::Fulfilled {
        value: json!([1]),
        tags: vec![],
      },
    );
    let (seq, _) = store.begin_fetch(&key).unwrap();
    store.complete_fetch(&key, seq, FetchOutcome::Rejected(ApiError::Network("down".into())));

    let entry = store.get(&key).unwrap();
    assert!(entry.is_error());
    assert_eq!(entry.value, Some(json!([1])));
    assert_eq!(entry.error, Some(ApiError::Network("down".into())));
  }

  #[test]
  fn test_patch_value_returns_previous() {
    let (store, key, _sub) = store_with("getEmployee", json!({ "id": 1 }));
    assert_eq!(store.patch_value(&key, |_| {}), None);

    let (seq, _) = store.begin_fetch(&key).unwrap();
    store.complete_fetch(
      &key,
      seq,
      FetchOutcome::Fulfilled {
        value: json!({ "name": "Ada" }),
        tags: vec![],
      },
    );

    let previous = store.patch_value(&key, |v| v["name"] = json!("Grace"));
    assert_eq!(previous, Some(json!({ "name": "Ada" })));
    assert_eq!(store.get(&key).unwrap().value, Some(json!({ "name": "Grace" })));
  }

  #[test]
  fn test_response_issued_before_invalidation_keeps_entry_stale() {
    let (store, key, _sub) = store_with("listEmployees", Value::Null);
    let fulfilled = |value: Value| FetchOutcome::Fulfilled {
      value,
      tags: vec![],
    };

    let (before, _) = store.begin_fetch(&key).unwrap();
    assert!(store.mark_stale(&key));
    assert!(store.complete_fetch(&key, before, fulfilled(json!([1]))));
    let entry = store.get(&key).unwrap();
    assert!(entry.stale);
    assert!(!entry.is_fresh(None));

    let (after, _) = store.begin_fetch(&key).unwrap();
    assert!(store.complete_fetch(&key, after, fulfilled(json!([1, 2]))));
    let entry = store.get(&key).unwrap();
    assert!(!entry.stale);
    assert!(entry.is_fresh(None));
  }

  #[test]
  fn test_mark_stale_missing_entry() {
    let store = CacheStore::new();
    assert!(!store.mark_stale(&CacheKey::new("listEmployees", &Value::Null)));
  }

  #[test]
  fn test_listeners_see_writes() {
    let (store, key, _sub) = store_with("listEmployees", Value::Null);
    let mut rx = store.listen();
    store.mark_stale(&key);
    assert_eq!(rx.try_recv().unwrap(), key);
  }
}
