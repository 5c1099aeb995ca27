//! The response cache as a pipeline [`Middleware`].
//!
//! Per request the middleware resolves a [`Strategy`], looks the key up in
//! the store, and either replays the stored response or runs the rest of the
//! chain. Concurrent misses for the same key are coalesced: one request runs
//! downstream while the others wait for and replay its captured response.

use std::{
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    capture::ResponseCapture,
    coalesce::{Coalesced, Coalescer},
    config::CacheConfig,
    entry::{CachedResponse, Expiration},
    error::{CoalesceError, ConfigError},
    key::CacheKey,
    store::CacheStore,
};
use crate::{
    Request, Response, StatusCode,
    context::Context,
    middleware::{Middleware, Next},
};

type Resolver = Arc<dyn Fn(&Request) -> Strategy + Send + Sync>;

/// Callback run with the request and the response about to be replayed.
pub type ReplayHook = Arc<dyn Fn(&Request, &CachedResponse) + Send + Sync>;

/// Callback that may rewrite a copy of the response right before replay.
pub type BeforeReplayHook = Arc<dyn Fn(&Request, &mut CachedResponse) + Send + Sync>;

/// Per-request caching decision.
#[derive(Clone)]
pub struct Strategy {
    pub cache_key: String,
    /// Overrides the middleware's store for this request.
    pub store: Option<Arc<dyn CacheStore>>,
    /// Overrides the configured expiration for this request.
    pub expiration: Option<Expiration>,
    pub should_cache: bool,
}

impl Strategy {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            store: None,
            expiration: None,
            should_cache: true,
        }
    }

    /// Bypasses the cache entirely.
    pub fn skip() -> Self {
        Self {
            should_cache: false,
            ..Self::new(String::new())
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Keys on method, path, canonical query and (for non-`GET`) body.
    pub fn by_request_uri(request: &Request) -> Self {
        Self::new(CacheKey::from_request(request))
    }

    /// Keys on method and path only.
    pub fn by_request_path(request: &Request) -> Self {
        Self::new(CacheKey::bounded(format!(
            "{} {}",
            request.method(),
            request.path()
        )))
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("cache_key", &self.cache_key)
            .field("store", &self.store.as_ref().map(|_| "override"))
            .field("expiration", &self.expiration)
            .field("should_cache", &self.should_cache)
            .finish()
    }
}

// What waiters of a flight receive.
#[derive(Clone)]
enum Outcome {
    Completed(CachedResponse),
    // The leader's request was aborted; its response must not be reused.
    Aborted,
}

#[derive(Default)]
struct Hooks {
    on_hit: Option<ReplayHook>,
    on_shared: Option<ReplayHook>,
    before_replay: Option<BeforeReplayHook>,
}

struct Inner {
    config: CacheConfig,
    expiration: Expiration,
    store: Arc<dyn CacheStore>,
    resolver: Resolver,
    coalescer: Coalescer<Outcome>,
    hooks: Hooks,
    serial: Option<Mutex<()>>,
}

/// Response-caching middleware.
///
/// Cheap to clone; clones share the store and the in-flight registry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use pagecache::cache::{CacheMiddleware, InMemoryStore, Strategy};
/// use pagecache::context::Context;
/// use pagecache::middleware::{Next, from_middleware, handler};
/// use pagecache::{Method, Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = CacheMiddleware::builder(Arc::new(InMemoryStore::default()))
///     .resolver(Strategy::by_request_uri)
///     .build()
///     .unwrap();
/// let chain = vec![
///     from_middleware(Arc::new(cache)),
///     handler(|_ctx: Context| async { Response::new(StatusCode::Ok).body("fresh") }),
/// ];
///
/// let ctx = Context::new(Request::new(Method::Get, "/"));
/// let resp = Next::new(chain).run(ctx).await;
/// assert_eq!(resp.body_bytes().as_ref(), b"fresh");
/// # }
/// ```
#[derive(Clone)]
pub struct CacheMiddleware {
    inner: Arc<Inner>,
}

impl CacheMiddleware {
    /// Starts a builder writing to `store` unless a strategy overrides it.
    pub fn builder(store: Arc<dyn CacheStore>) -> CacheMiddlewareBuilder {
        CacheMiddlewareBuilder {
            store,
            config: CacheConfig::default(),
            expiration: None,
            resolver: None,
            hooks: Hooks::default(),
        }
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.in_flight()
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.serve(ctx, next).await })
    }
}

impl Inner {
    async fn serve(&self, ctx: Context, next: Next) -> Response {
        let _serial = match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let strategy = (self.resolver)(ctx.request());
        if !strategy.should_cache {
            return next.run(ctx).await;
        }

        let key = self.config.namespaced(&strategy.cache_key);
        let store = strategy.store.unwrap_or_else(|| Arc::clone(&self.store));
        let expiration = strategy.expiration.unwrap_or(self.expiration);

        if let Some(cached) = lookup(store.as_ref(), &key).await {
            debug!(key = %key, status = %cached.status(), "cache hit");
            self.notify(self.hooks.on_hit.as_ref(), ctx.request(), &cached);
            return self.replay(ctx.request(), &cached);
        }
        debug!(key = %key, "cache miss");

        let request = ctx.request().clone();
        let cancel = ctx.cancellation().clone();
        let flight = flight_key(&store, &key);
        let mut pending = Some((ctx, next));
        let mut own = None;

        let result = {
            let pending = &mut pending;
            let own = &mut own;
            let store = store.as_ref();
            let key = key.as_str();
            self.coalescer
                .execute(&flight, &cancel, move || {
                    let taken = pending.take();
                    async move {
                        let Some((ctx, next)) = taken else {
                            return Outcome::Aborted;
                        };
                        let (response, outcome) =
                            self.run_downstream(ctx, next, store, key, expiration).await;
                        *own = Some(response);
                        outcome
                    }
                })
                .await
        };

        if let Some(response) = own {
            return response;
        }

        match result {
            Ok(Coalesced {
                value: Outcome::Completed(cached),
                ..
            }) => {
                debug!(key = %key, status = %cached.status(), "shared in-flight response");
                self.notify(self.hooks.on_shared.as_ref(), &request, &cached);
                self.replay(&request, &cached)
            }
            Ok(Coalesced {
                value: Outcome::Aborted,
                ..
            })
            | Err(CoalesceError::Abandoned) => {
                debug!(key = %key, "in-flight request gave up, running independently");
                match pending.take() {
                    Some((ctx, next)) => {
                        self.run_downstream(ctx, next, store.as_ref(), &key, expiration)
                            .await
                            .0
                    }
                    None => Response::new(StatusCode::InternalServerError),
                }
            }
            Err(CoalesceError::Cancelled) => {
                debug!(key = %key, "cancelled while waiting for in-flight response");
                Response::new(StatusCode::GatewayTimeout)
            }
        }
    }

    // Runs the rest of the chain, streams its response through a capture and
    // persists the copy when it is cacheable.
    async fn run_downstream(
        &self,
        ctx: Context,
        next: Next,
        store: &dyn CacheStore,
        key: &str,
        expiration: Expiration,
    ) -> (Response, Outcome) {
        let aborted = ctx.abort_handle();
        let downstream = next.run(ctx).await;

        let mut output = Response::default();
        let mut capture = ResponseCapture::new(&mut output);
        if let Err(e) = downstream.write_to(&mut capture) {
            warn!(key = %key, error = %e, "response write failed during capture");
        }
        let (_, cached) = capture.finish();

        if aborted.is_aborted() {
            debug!(key = %key, "request aborted, dropping cached entry");
            match store.delete(key).await {
                Ok(()) => {}
                Err(e) if e.is_miss() => {}
                Err(e) => warn!(key = %key, error = %e, "failed to delete aborted entry"),
            }
            return (output, Outcome::Aborted);
        }

        if cached.is_cacheable() {
            persist(store, key, &cached, expiration).await;
        } else {
            debug!(key = %key, status = %cached.status(), "response not cacheable");
        }
        (output, Outcome::Completed(cached))
    }

    fn replay(&self, request: &Request, cached: &CachedResponse) -> Response {
        let mut out = Response::default();
        let written = match &self.hooks.before_replay {
            Some(hook) => {
                let mut copy = cached.clone();
                match panic::catch_unwind(AssertUnwindSafe(|| hook(request, &mut copy))) {
                    Ok(()) => copy.replay(&mut out),
                    Err(_) => {
                        warn!(uri = request.target(), "before-replay callback panicked");
                        cached.replay(&mut out)
                    }
                }
            }
            None => cached.replay(&mut out),
        };
        if let Err(e) = written {
            warn!(error = %e, "failed to replay cached response");
        }
        out
    }

    fn notify(&self, hook: Option<&ReplayHook>, request: &Request, cached: &CachedResponse) {
        let Some(hook) = hook else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| hook(request, cached))).is_err() {
            warn!(uri = request.target(), "cache callback panicked");
        }
    }
}

// Flights are scoped to the store they write to, so a waiter only ever
// replays a response its own store received.
fn flight_key(store: &Arc<dyn CacheStore>, key: &str) -> String {
    format!("{:p}|{key}", Arc::as_ptr(store).cast::<()>())
}

async fn lookup(store: &dyn CacheStore, key: &str) -> Option<CachedResponse> {
    let raw = match store.get(key).await {
        Ok(raw) => raw,
        Err(e) if e.is_miss() => return None,
        Err(e) => {
            warn!(key = %key, error = %e, "cache read failed, treating as miss");
            return None;
        }
    };
    match CachedResponse::decode(&raw) {
        Ok(cached) => Some(cached),
        Err(e) => {
            warn!(key = %key, error = %e, "undecodable cache entry, treating as miss");
            None
        }
    }
}

async fn persist(store: &dyn CacheStore, key: &str, cached: &CachedResponse, expiration: Expiration) {
    let encoded = match cached.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(key = %key, error = %e, "failed to encode response");
            return;
        }
    };
    match store.set(key, encoded, expiration).await {
        Ok(()) => debug!(key = %key, "response cached"),
        Err(e) => warn!(key = %key, error = %e, "failed to cache response"),
    }
}

/// Builder for [`CacheMiddleware`].
#[must_use]
pub struct CacheMiddlewareBuilder {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    expiration: Option<Expiration>,
    resolver: Option<Resolver>,
    hooks: Hooks,
}

impl CacheMiddlewareBuilder {
    /// Replaces the whole configuration; later setters still apply on top.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Required: decides per request whether and how to cache.
    pub fn resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Request) -> Strategy + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Expiration for written responses; takes precedence over the config.
    pub fn expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn forget_timeout(mut self, timeout: Duration) -> Self {
        self.config.forget_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn serialize_requests(mut self, enabled: bool) -> Self {
        self.config.serialize_requests = enabled;
        self
    }

    /// Called when a stored response is about to be replayed.
    pub fn on_hit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, &CachedResponse) + Send + Sync + 'static,
    {
        self.hooks.on_hit = Some(Arc::new(hook));
        self
    }

    /// Called when a waiter replays another request's in-flight response.
    pub fn on_shared<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, &CachedResponse) + Send + Sync + 'static,
    {
        self.hooks.on_shared = Some(Arc::new(hook));
        self
    }

    /// Called with a private copy of every replayed response; changes only
    /// affect that one replay.
    pub fn on_before_replay<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, &mut CachedResponse) + Send + Sync + 'static,
    {
        self.hooks.before_replay = Some(Arc::new(hook));
        self
    }

    /// # Errors
    ///
    /// [`ConfigError::MissingResolver`] when no resolver was set.
    pub fn build(self) -> Result<CacheMiddleware, ConfigError> {
        let resolver = self.resolver.ok_or(ConfigError::MissingResolver)?;

        let mut coalescer = Coalescer::new();
        if let Some(timeout) = self.config.forget_timeout() {
            coalescer = coalescer.forget_after(timeout);
        }
        let expiration = self.expiration.unwrap_or_else(|| self.config.expiration());
        let serial = self.config.serialize_requests.then(|| Mutex::new(()));

        Ok(CacheMiddleware {
            inner: Arc::new(Inner {
                config: self.config,
                expiration,
                store: self.store,
                resolver,
                coalescer,
                hooks: self.hooks,
                serial,
            }),
        })
    }
}
