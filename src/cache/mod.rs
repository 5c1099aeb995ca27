//! Response caching with request coalescing.
//!
//! ## Layout
//!
//! - [`CacheStore`] — the async key-value contract, with [`InMemoryStore`]
//!   as the bundled backend.
//! - [`key`] — canonical cache keys derived from a request.
//! - [`ResponseCapture`] — a [`ResponseWriter`](crate::http::ResponseWriter)
//!   that records what passes through it.
//! - [`Coalescer`] — at most one in-flight computation per key.
//! - [`CacheMiddleware`] — ties the above together as a pipeline layer.

mod capture;
mod codec;
mod coalesce;
mod config;
mod entry;
mod error;
pub mod key;
mod memory;
mod middleware;
mod store;

pub use capture::ResponseCapture;
pub use coalesce::{Coalesced, Coalescer};
pub use config::{CacheConfig, DEFAULT_KEY_PREFIX};
pub use entry::{CachedResponse, Expiration};
pub use error::{CoalesceError, ConfigError, StoreError, StoreResult};
pub use key::CacheKey;
pub use memory::{DEFAULT_EXPIRATION, InMemoryStore};
pub use middleware::{
    BeforeReplayHook, CacheMiddleware, CacheMiddlewareBuilder, ReplayHook, Strategy,
};
pub use store::{CacheStore, CacheStoreExt};
