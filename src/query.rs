//! Query executor: deduplicated, cached data fetching.
//!
//! Inspired by TanStack Query and RTK Query, [`QueryClient`] turns
//! `(endpoint, args)` pairs into cache entries and network requests:
//!
//! 1. A fulfilled, non-stale entry is served without a network call
//! 2. A request already in flight for the same key is shared, not repeated
//! 3. Otherwise a request goes out through the auth interceptor and its
//!    result (or error) is written back to the cache store
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::new(registry, interceptor, QueryConfig::default());
//!
//! // One-shot read
//! let employees = client.query("listEmployees", ()).await?;
//!
//! // Live subscription, revalidated every 15s
//! let mut sub = client.subscribe(
//!     "listNotifications",
//!     (),
//!     SubscribeOptions::polling(Duration::from_secs(15)),
//! )?;
//! while let Some(state) = sub.changed().await {
//!     render(state);
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::auth::AuthInterceptor;
use crate::cache::{
  CacheEntry, CacheKey, CacheStore, EntryPatch, FetchOutcome, QueryOrigin, QueryStatus,
  StoreSubscription, SubscriberId,
};
use crate::endpoint::{EndpointRegistry, QueryEndpoint};
use crate::error::ApiError;
use crate::poller::Poller;
use crate::tag::Tag;

/// A request result shared by every caller attached to it.
pub type QueryFuture = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

/// Configuration for query behavior.
#[derive(Debug, Clone)]
pub struct QueryConfig {
  /// How long an entry without subscribers is kept before eviction.
  pub keep_unused: Duration,

  /// Age after which a fulfilled entry is refetched on the next subscription.
  ///
  /// `None` keeps fulfilled entries fresh until they are invalidated.
  pub stale_time: Option<Duration>,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      keep_unused: Duration::from_secs(60),
      stale_time: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
  pub poll_interval: Option<Duration>,
}

impl SubscribeOptions {
  pub fn polling(interval: Duration) -> Self {
    Self {
      poll_interval: Some(interval),
    }
  }
}

/// Which entries an invalidation sweep refetched or only marked stale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
  pub refetched: Vec<CacheKey>,
  pub staled: Vec<CacheKey>,
}

impl InvalidationReport {
  pub fn is_empty(&self) -> bool {
    self.refetched.is_empty() && self.staled.is_empty()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
  /// Serve fresh cache, join an in-flight request, or fetch
  IfStale,
  /// Always issue a new request, superseding any in flight
  Force,
  /// Fetch unless a request is already in flight
  PollTick,
}

struct InFlight {
  seq: u64,
  future: QueryFuture,
}

pub(crate) struct ClientInner {
  pub(crate) registry: EndpointRegistry,
  pub(crate) store: Arc<CacheStore>,
  pub(crate) interceptor: AuthInterceptor,
  pub(crate) config: QueryConfig,
  in_flight: Mutex<HashMap<CacheKey, InFlight>>,
  pub(crate) poller: Poller,
}

/// Entry point for queries, mutations and invalidation.
///
/// Cheap to clone; clones share one cache. Methods that start requests must
/// be called inside a Tokio runtime.
#[derive(Clone)]
pub struct QueryClient {
  pub(crate) inner: Arc<ClientInner>,
}

impl QueryClient {
  pub fn new(registry: EndpointRegistry, interceptor: AuthInterceptor, config: QueryConfig) -> Self {
    let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
      let weak = weak.clone();
      ClientInner {
        registry,
        store: Arc::new(CacheStore::new()),
        interceptor,
        config,
        in_flight: Mutex::new(HashMap::new()),
        poller: Poller::new(move |key| {
          if let Some(inner) = weak.upgrade() {
            inner.fetch(key, FetchMode::PollTick);
          }
        }),
      }
    });
    Self { inner }
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  pub fn registry(&self) -> &EndpointRegistry {
    &self.inner.registry
  }

  pub fn interceptor(&self) -> &AuthInterceptor {
    &self.inner.interceptor
  }

  /// Cache key for a query call, without touching the cache.
  pub fn key_for<A: Serialize>(&self, endpoint: &str, args: A) -> Result<CacheKey, ApiError> {
    let endpoint = self.inner.registry.query(endpoint)?;
    Ok(CacheKey::new(endpoint.id(), &serde_json::to_value(args)?))
  }

  /// Subscribe to a query. The entry is created on first subscription and a
  /// fetch starts unless a fresh value is cached or a request is running.
  pub fn subscribe<A: Serialize>(
    &self,
    endpoint: &str,
    args: A,
    options: SubscribeOptions,
  ) -> Result<QuerySubscription, ApiError> {
    let endpoint = self.inner.registry.query(endpoint)?;
    let args = serde_json::to_value(args)?;
    let key = CacheKey::new(endpoint.id(), &args);

    let events = self.inner.store.listen();
    let handle = self.inner.store.subscribe(
      &key,
      QueryOrigin {
        endpoint: endpoint.id().to_string(),
        args,
      },
    );

    if let Some(interval) = options.poll_interval {
      self.inner.poller.add(&key, handle.id(), interval);
      self.inner.sync_poll_interval(&key);
    }
    self.inner.fetch(&key, FetchMode::IfStale);

    Ok(QuerySubscription {
      inner: Arc::clone(&self.inner),
      handle,
      events,
    })
  }

  /// Subscribe, wait for the result, then release the subscription. The
  /// entry stays cached for `keep_unused`.
  pub async fn query<A: Serialize>(&self, endpoint: &str, args: A) -> Result<Value, ApiError> {
    let sub = self.subscribe(endpoint, args, SubscribeOptions::default())?;
    sub.settled().await
  }

  /// Typed variant of [`query`](Self::query).
  pub async fn query_as<T, A>(&self, endpoint: &str, args: A) -> Result<T, ApiError>
  where
    T: DeserializeOwned,
    A: Serialize,
  {
    let value = self.query(endpoint, args).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Force a new request for `key`, bypassing the freshness shortcut.
  pub fn refetch(&self, key: &CacheKey) -> Option<QueryFuture> {
    self.inner.fetch(key, FetchMode::Force)
  }

  /// The in-flight request for `key`, if any.
  pub fn running_query(&self, key: &CacheKey) -> Option<QueryFuture> {
    self.inner.running(key)
  }

  /// Refetch subscribed entries providing any of `tags`; mark the rest stale.
  pub fn invalidate_tags(&self, tags: &[Tag]) -> InvalidationReport {
    self.inner.invalidate_tags(tags)
  }

  /// Evict every entry unused for longer than `keep_unused`.
  pub fn collect_garbage(&self) -> Vec<CacheKey> {
    self.inner.store.collect_garbage(self.inner.config.keep_unused)
  }
}

impl ClientInner {
  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight>> {
    self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn running(&self, key: &CacheKey) -> Option<QueryFuture> {
    self.lock_in_flight().get(key).map(|r| r.future.clone())
  }

  /// Decide whether `key` needs a request and start it.
  ///
  /// Returns the future callers should await, or `None` when the cache is
  /// served as-is or the poll tick was skipped.
  pub(crate) fn fetch(self: &Arc<Self>, key: &CacheKey, mode: FetchMode) -> Option<QueryFuture> {
    let mut in_flight = self.lock_in_flight();
    let entry = self.store.get(key)?;

    if let Some(running) = in_flight.get(key) {
      match mode {
        FetchMode::IfStale if entry.stale && running.seq <= entry.stale_since_seq => {
          debug!(key = %key, "In-flight request predates invalidation, refetching");
        }
        FetchMode::IfStale => {
          debug!(key = %key, "Joining in-flight request");
          return Some(running.future.clone());
        }
        FetchMode::PollTick => {
          debug!(key = %key, "Poll tick skipped, request already in flight");
          return None;
        }
        FetchMode::Force => {}
      }
    }

    if mode == FetchMode::IfStale && entry.is_fresh(self.config.stale_time) {
      debug!(key = %key, "Cache hit");
      return None;
    }

    let endpoint = match self.registry.query(&entry.origin.endpoint) {
      Ok(endpoint) => endpoint,
      Err(e) => {
        warn!(key = %key, error = %e, "Cannot refetch entry");
        return None;
      }
    };

    let (seq, origin) = self.store.begin_fetch(key)?;
    debug!(key = %key, seq, ?mode, "Starting request");
    let request = endpoint.build_request(&origin.args);

    let inner = Arc::clone(self);
    let task_key = key.clone();
    let task = tokio::spawn(async move {
      let result = match request {
        Ok(request) => inner
          .interceptor
          .execute(request)
          .await
          .and_then(|raw| endpoint.transform(raw)),
        Err(e) => Err(e),
      };
      inner.settle(&task_key, seq, &endpoint, &origin.args, &result);
      result
    });

    let future: QueryFuture = task
      .map(|joined| {
        joined.unwrap_or_else(|e| Err(ApiError::Network(format!("Request task failed: {}", e))))
      })
      .boxed()
      .shared();

    in_flight.insert(
      key.clone(),
      InFlight {
        seq,
        future: future.clone(),
      },
    );
    Some(future)
  }

  /// Write a settled request and release its in-flight slot.
  fn settle(
    &self,
    key: &CacheKey,
    seq: u64,
    endpoint: &QueryEndpoint,
    args: &Value,
    result: &Result<Value, ApiError>,
  ) {
    let outcome = match result {
      Ok(value) => FetchOutcome::Fulfilled {
        value: value.clone(),
        tags: endpoint.tags_provided(value, args),
      },
      Err(error) => FetchOutcome::Rejected(error.clone()),
    };
    self.store.complete_fetch(key, seq, outcome);

    let mut in_flight = self.lock_in_flight();
    if in_flight.get(key).is_some_and(|r| r.seq == seq) {
      in_flight.remove(key);
    }
  }

  pub(crate) fn invalidate_tags(self: &Arc<Self>, tags: &[Tag]) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    if tags.is_empty() {
      return report;
    }

    for key in self.store.keys_for_tags(tags) {
      self.store.mark_stale(&key);
      if self.store.subscriber_count(&key) > 0 {
        self.fetch(&key, FetchMode::Force);
        report.refetched.push(key);
      } else {
        report.staled.push(key);
      }
    }

    debug!(
      tags = ?tags.iter().map(Tag::to_string).collect::<Vec<_>>(),
      refetched = report.refetched.len(),
      staled = report.staled.len(),
      "Invalidated tags"
    );
    report
  }

  pub(crate) fn sync_poll_interval(&self, key: &CacheKey) {
    self
      .store
      .upsert(key, EntryPatch::new().poll_interval(self.poller.interval(key)));
  }

  /// Evict `key` after the grace period unless someone re-subscribes.
  pub(crate) fn schedule_eviction(self: &Arc<Self>, key: &CacheKey) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      // Left for collect_garbage
      return;
    };
    let grace = self.config.keep_unused;
    let inner = Arc::downgrade(self);
    let key = key.clone();
    runtime.spawn(async move {
      tokio::time::sleep(grace).await;
      if let Some(inner) = inner.upgrade() {
        inner.store.evict_if_unused(&key, grace);
      }
    });
  }
}

/// A live subscription to one cache entry.
///
/// Dropping the subscription disposes it. When the last subscriber of a key
/// goes away its poll timer stops and eviction is scheduled.
pub struct QuerySubscription {
  inner: Arc<ClientInner>,
  handle: StoreSubscription,
  events: broadcast::Receiver<CacheKey>,
}

impl QuerySubscription {
  pub fn key(&self) -> &CacheKey {
    self.handle.key()
  }

  pub fn id(&self) -> SubscriberId {
    self.handle.id()
  }

  /// Current snapshot of the entry.
  pub fn state(&self) -> Option<CacheEntry> {
    self.inner.store.get(self.key())
  }

  pub fn status(&self) -> QueryStatus {
    self
      .state()
      .map(|e| e.status)
      .unwrap_or(QueryStatus::Uninitialized)
  }

  /// Cached value decoded as `T`, if there is one.
  pub fn data<T: DeserializeOwned>(&self) -> Result<Option<T>, ApiError> {
    match self.state().and_then(|e| e.value) {
      Some(value) => Ok(Some(serde_json::from_value(value)?)),
      None => Ok(None),
    }
  }

  pub fn error(&self) -> Option<ApiError> {
    self.state().and_then(|e| e.error)
  }

  /// Wait for the running request, if any, and return the entry's result.
  pub async fn settled(&self) -> Result<Value, ApiError> {
    if let Some(running) = self.inner.running(self.key()) {
      return running.await;
    }

    let entry = self
      .state()
      .ok_or_else(|| ApiError::Endpoint(format!("No cache entry for {}", self.key())))?;
    match entry.status {
      QueryStatus::Fulfilled => Ok(entry.value.unwrap_or(Value::Null)),
      QueryStatus::Rejected => Err(
        entry
          .error
          .unwrap_or_else(|| ApiError::Network("Request failed".to_string())),
      ),
      QueryStatus::Uninitialized | QueryStatus::Pending => {
        match self.inner.fetch(self.key(), FetchMode::IfStale) {
          Some(running) => running.await,
          None => Err(ApiError::Endpoint(format!(
            "No request could be started for {}",
            self.key()
          ))),
        }
      }
    }
  }

  /// Wait for the next write to this entry and return the new state.
  ///
  /// Returns `None` once the cache is gone.
  pub async fn changed(&mut self) -> Option<CacheEntry> {
    loop {
      match self.events.recv().await {
        Ok(key) if &key == self.handle.key() => return self.state(),
        Ok(_) => continue,
        Err(RecvError::Lagged(_)) => return self.state(),
        Err(RecvError::Closed) => return None,
      }
    }
  }

  /// Manual refetch, bypassing the freshness shortcut.
  pub fn refetch(&self) -> Option<QueryFuture> {
    self.inner.fetch(self.key(), FetchMode::Force)
  }

  pub fn is_disposed(&self) -> bool {
    self.handle.is_disposed()
  }

  /// Release this subscription. Idempotent; returns `true` the first time.
  pub fn dispose(&self) -> bool {
    let Some(remaining) = self.handle.dispose() else {
      return false;
    };

    self.released(remaining);
    true
  }

  /// Poller and eviction bookkeeping once the store has dropped this
  /// subscriber. Only this subscriber's poll request is withdrawn; a timer
  /// started by someone who subscribed in the meantime keeps running.
  fn released(&self, remaining: usize) {
    let key = self.handle.key();
    self.inner.poller.remove(key, self.handle.id());
    if remaining == 0 {
      self.inner.schedule_eviction(key);
    }
    self.inner.sync_poll_interval(key);
  }
}

impl Drop for QuerySubscription {
  fn drop(&mut self) {
    self.dispose();
  }
}
