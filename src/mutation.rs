//! Mutations: optimistic cache edits, rollback, and tag invalidation.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, EntryPatch, FetchOutcome, QueryOrigin};
use crate::error::ApiError;
use crate::query::{ClientInner, InvalidationReport, QueryClient};

type Recipe = Box<dyn FnOnce(&mut Value) + Send>;

/// A speculative edit of one cached query value.
pub struct OptimisticUpdate {
  endpoint: String,
  args: Value,
  recipe: Recipe,
}

/// Options for [`QueryClient::mutate`].
#[derive(Default)]
pub struct MutateOptions {
  optimistic: Vec<OptimisticUpdate>,
  upserts: Vec<(String, Value)>,
}

impl MutateOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Edit the cached value of `endpoint(args)` before the request settles.
  /// Reverted if the mutation fails. Keys without a cached value are skipped.
  pub fn optimistic<F>(mut self, endpoint: impl Into<String>, args: Value, recipe: F) -> Self
  where
    F: FnOnce(&mut Value) + Send + 'static,
  {
    self.optimistic.push(OptimisticUpdate {
      endpoint: endpoint.into(),
      args,
      recipe: Box::new(recipe),
    });
    self
  }

  /// Write the mutation result into the cache as the value of
  /// `endpoint(args)` before invalidation runs.
  pub fn upsert_query(mut self, endpoint: impl Into<String>, args: Value) -> Self {
    self.upserts.push((endpoint.into(), args));
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
  pub data: Value,
  pub invalidation: InvalidationReport,
}

/// Remembers pre-patch values and restores them unless committed.
struct OptimisticGuard<'a> {
  store: &'a CacheStore,
  snapshots: Vec<(CacheKey, Value)>,
  committed: bool,
}

impl<'a> OptimisticGuard<'a> {
  fn new(store: &'a CacheStore) -> Self {
    Self {
      store,
      snapshots: Vec::new(),
      committed: false,
    }
  }

  fn apply(&mut self, key: CacheKey, recipe: Recipe) {
    match self.store.patch_value(&key, recipe) {
      Some(previous) => {
        debug!(key = %key, "Applied optimistic update");
        self.snapshots.push((key, previous));
      }
      None => debug!(key = %key, "No cached value, optimistic update skipped"),
    }
  }

  fn commit(mut self) {
    self.committed = true;
  }
}

impl Drop for OptimisticGuard<'_> {
  fn drop(&mut self) {
    if self.committed {
      return;
    }
    // Reverse order so a key patched twice ends at its first snapshot
    for (key, previous) in self.snapshots.drain(..).rev() {
      if self.store.upsert(&key, EntryPatch::new().value(Some(previous))) {
        debug!(key = %key, "Rolled back optimistic update");
      }
    }
  }
}

impl QueryClient {
  /// Run a mutation.
  ///
  /// Optimistic updates are applied before the request is sent and rolled
  /// back if it fails. On success, requested query upserts are written and
  /// then every entry providing an invalidated tag is refetched (if
  /// subscribed) or marked stale. Mutations never wait on each other; if two
  /// overlap, the last response to arrive wins.
  pub async fn mutate<A: Serialize>(
    &self,
    endpoint: &str,
    args: A,
    options: MutateOptions,
  ) -> Result<MutationOutcome, ApiError> {
    let endpoint = self.inner.registry.mutation(endpoint)?;
    let args = serde_json::to_value(args)?;
    let request = endpoint.build_request(&args)?;

    let mut guard = OptimisticGuard::new(&self.inner.store);
    for update in options.optimistic {
      let key = self.key_for(&update.endpoint, &update.args)?;
      guard.apply(key, update.recipe);
    }

    let result = self
      .inner
      .interceptor
      .execute(request)
      .await
      .and_then(|raw| endpoint.transform(raw));

    let data = match result {
      Ok(data) => data,
      Err(e) => {
        info!(endpoint = endpoint.id(), error = %e, "Mutation failed");
        // guard drops here and rolls back
        return Err(e);
      }
    };
    guard.commit();

    for (query, query_args) in &options.upserts {
      if let Err(e) = self.inner.upsert_query(query, query_args, &data) {
        warn!(endpoint = %query, error = %e, "Failed to upsert mutation result");
      }
    }

    let tags = endpoint.tags_invalidated(&args, &data);
    let invalidation = self.inner.invalidate_tags(&tags);
    debug!(
      endpoint = endpoint.id(),
      refetched = invalidation.refetched.len(),
      staled = invalidation.staled.len(),
      "Mutation succeeded"
    );

    Ok(MutationOutcome { data, invalidation })
  }
}

impl ClientInner {
  /// Write `value` as a fulfilled result for `endpoint(args)`, superseding
  /// any request in flight for that key.
  fn upsert_query(self: &Arc<Self>, endpoint: &str, args: &Value, value: &Value) -> Result<(), ApiError> {
    let query = self.registry.query(endpoint)?;
    let key = CacheKey::new(query.id(), args);

    let created = !self.store.contains(&key);
    self.store.upsert(
      &key,
      EntryPatch::new().origin(QueryOrigin {
        endpoint: query.id().to_string(),
        args: args.clone(),
      }),
    );

    if let Some((seq, _)) = self.store.begin_fetch(&key) {
      let tags = query.tags_provided(value, args);
      self.store.complete_fetch(
        &key,
        seq,
        FetchOutcome::Fulfilled {
          value: value.clone(),
          tags,
        },
      );
    }

    if created || self.store.subscriber_count(&key) == 0 {
      self.schedule_eviction(&key);
    }
    Ok(())
  }
}
