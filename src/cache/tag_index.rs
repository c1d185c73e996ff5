//! Reverse index from tag to the cache keys currently providing it.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::key::CacheKey;
use crate::tag::Tag;

#[derive(Debug, Default)]
pub struct TagIndex {
  buckets: HashMap<Tag, HashSet<CacheKey>>,
}

impl TagIndex {
  pub fn new() -> Self {
    Self::default()
  }

  /// Move `key` from `old` tags to `new` tags. Empty buckets are dropped.
  pub fn replace(&mut self, key: &CacheKey, old: &[Tag], new: &[Tag]) {
    self.remove(key, old);
    for tag in new {
      self.buckets.entry(tag.clone()).or_default().insert(key.clone());
    }
  }

  pub fn remove(&mut self, key: &CacheKey, tags: &[Tag]) {
    for tag in tags {
      if let Some(bucket) = self.buckets.get_mut(tag) {
        bucket.remove(key);
        if bucket.is_empty() {
          self.buckets.remove(tag);
        }
      }
    }
  }

  /// Union of keys registered under any of `tags`, in stable order.
  pub fn lookup(&self, tags: &[Tag]) -> BTreeSet<CacheKey> {
    tags
      .iter()
      .filter_map(|tag| self.buckets.get(tag))
      .flat_map(|bucket| bucket.iter().cloned())
      .collect()
  }

  pub fn contains_key(&self, key: &CacheKey) -> bool {
    self.buckets.values().any(|bucket| bucket.contains(key))
  }

  pub fn tag_count(&self) -> usize {
    self.buckets.len()
  }
}
