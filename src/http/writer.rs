//! The outbound response sink.
//!
//! A [`ResponseWriter`] is what a handler's response, or a cached replay,
//! is written through. [`Response`](super::Response) is the terminal sink;
//! wrappers such as the cache's response capture forward to another writer.

use std::io;

use super::{Headers, StatusCode};

/// A sink for an HTTP response: status, headers, then body bytes.
pub trait ResponseWriter {
    /// Sets the response status.
    fn write_status(&mut self, status: StatusCode);

    /// Appends a header value. Repeated names accumulate in call order.
    fn write_header(&mut self, name: &str, value: &str);

    /// Appends body bytes, returning how many were accepted.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the sink cannot accept the chunk.
    fn write(&mut self, chunk: &[u8]) -> io::Result<usize>;

    /// Status written so far.
    fn status(&self) -> StatusCode;

    /// Headers written so far.
    fn headers(&self) -> &Headers;
}

impl<W: ResponseWriter + ?Sized> ResponseWriter for &mut W {
    fn write_status(&mut self, status: StatusCode) {
        (**self).write_status(status);
    }

    fn write_header(&mut self, name: &str, value: &str) {
        (**self).write_header(name, value);
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        (**self).write(chunk)
    }

    fn status(&self) -> StatusCode {
        (**self).status()
    }

    fn headers(&self) -> &Headers {
        (**self).headers()
    }
}
