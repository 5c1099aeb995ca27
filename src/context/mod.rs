//! Per-request context: the request descriptor plus its abort and
//! cancellation signals.
//!
//! Handlers take a [`Context`] by value, so anything that must observe the
//! request after it has been handed downstream keeps an [`AbortHandle`] or a
//! clone of the [`CancellationToken`] instead.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio_util::sync::CancellationToken;

use crate::Request;

/// Shared view of a request's abort flag.
///
/// Cloned out of a [`Context`] before the context moves downstream; reads
/// reflect any later [`Context::abort`] call.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Marks the request as aborted.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns `true` once the request has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-request context.
pub struct Context {
    request: Request,
    aborted: AbortHandle,
    cancellation: CancellationToken,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            aborted: AbortHandle::default(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token, typically with a child of a
    /// connection- or deadline-scoped token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Marks the request as aborted: the handler gave up on producing a
    /// complete response.
    pub fn abort(&self) {
        self.aborted.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_aborted()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.aborted.clone()
    }

    /// Fires when the caller stops waiting for this request (deadline,
    /// disconnect).
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}
