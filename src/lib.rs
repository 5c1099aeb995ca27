//! # pagecache
//!
//! An HTTP response cache for async middleware pipelines. Concurrent misses
//! for the same resource are coalesced so the handler runs once per key.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagecache::cache::{CacheConfig, CacheMiddleware, Strategy};
//! use pagecache::context::Context;
//! use pagecache::middleware::{Next, from_middleware, handler};
//! use pagecache::{Method, Request, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CacheConfig::from_json(r#"{ "expiration_secs": 60 }"#)?;
//!     let store = Arc::new(config.in_memory_store());
//!     let _janitor = store.spawn_janitor(config.cleanup_interval());
//!
//!     let cache = CacheMiddleware::builder(store)
//!         .config(config)
//!         .resolver(Strategy::by_request_uri)
//!         .build()?;
//!
//!     let chain = vec![
//!         from_middleware(Arc::new(cache)),
//!         handler(|_ctx: Context| async { Response::new(StatusCode::Ok).body("Hello, World!") }),
//!     ];
//!     let ctx = Context::new(Request::new(Method::Get, "/hello"));
//!     let resp = Next::new(chain).run(ctx).await;
//!     println!("{}", resp.status());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;

pub use http::{Headers, Method, Request, Response, ResponseWriter, StatusCode};
