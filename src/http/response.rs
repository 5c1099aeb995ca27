//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses. A
//! [`Response`] is also the terminal [`ResponseWriter`]: writes land directly
//! in its status, headers, and body.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, ResponseWriter, StatusCode};

/// An HTTP/1.1 response.
///
/// # Examples
///
/// ```
/// use pagecache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.headers().get("content-type"), Some("application/json"));
/// assert_eq!(response.body_bytes().as_ref(), br#"{"status":"ok"}"#);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: BytesMut,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: BytesMut::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(self, body: impl Into<String>) -> Self {
        self.bytes(body.into().into_bytes())
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn bytes(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body.clear();
        self.body.put_slice(body.as_ref());
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a copy of the body written so far.
    pub fn body_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    /// Streams this response through `out`: status, each header in order,
    /// then the body as a single chunk (skipped when empty).
    ///
    /// # Errors
    ///
    /// Propagates the first body write failure reported by `out`.
    pub fn write_to<W: ResponseWriter + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        out.write_status(self.status);
        for (name, value) in self.headers.iter() {
            out.write_header(name, value);
        }
        if !self.body.is_empty() {
            out.write(&self.body)?;
        }
        Ok(())
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl ResponseWriter for Response {
    fn write_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn write_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name, value);
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.body.put_slice(chunk);
        Ok(chunk.len())
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }
}
