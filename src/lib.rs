//! Query, cache and invalidation runtime for an HR REST API.
//!
//! Views subscribe to queries through a [`QueryClient`]; identical
//! subscriptions share one cache entry and one in-flight request. Mutations
//! invalidate cached entries by [`Tag`], and every request passes through an
//! [`AuthInterceptor`] that signs the session out once on a 401.

pub mod auth;
pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod poller;
pub mod query;
pub mod tag;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthInterceptor, MemorySession, Navigator, Session, SessionSource};
pub use cache::{CacheEntry, CacheKey, QueryStatus};
pub use endpoint::{Endpoint, EndpointRegistry};
pub use error::ApiError;
pub use mutation::{MutateOptions, MutationOutcome};
pub use query::{InvalidationReport, QueryClient, QueryConfig, QuerySubscription, SubscribeOptions};
pub use tag::{Tag, TagId, TagType};
pub use transport::{ReqwestTransport, Transport};
