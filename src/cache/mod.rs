//! Normalized in-memory cache of query results.
//!
//! This module provides the process-wide cache table:
//! - Entries keyed by endpoint id + canonical arguments
//! - A tag index kept in step with every entry write
//! - Reference-counted subscriptions with lazy eviction
//! - Per-key request sequence numbers so late responses cannot overwrite newer ones

mod entry;
mod key;
mod store;
mod tag_index;

pub use entry::{CacheEntry, EntryPatch, QueryOrigin, QueryStatus};
pub use key::{canonical_json, CacheKey};
pub use store::{CacheStore, FetchOutcome, StoreSubscription, SubscriberId};
pub use tag_index::TagIndex;
