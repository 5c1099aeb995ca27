//! Pass-through recording of a response as it is written.

use std::io;

use bytes::{BufMut, BytesMut};

use super::entry::CachedResponse;
use crate::http::{Headers, ResponseWriter, StatusCode};

/// Wraps a [`ResponseWriter`], forwarding every write while keeping a copy.
///
/// Status and headers are frozen in the copy at the first body write, the
/// point at which a real connection would have flushed them. Later status or
/// header writes still reach the inner writer but are not recorded.
///
/// # Examples
///
/// ```
/// use pagecache::cache::ResponseCapture;
/// use pagecache::http::{Response, ResponseWriter, StatusCode};
///
/// let mut out = Response::default();
/// let mut capture = ResponseCapture::new(&mut out);
/// capture.write_status(StatusCode::Created);
/// capture.write_header("X-A", "1");
/// capture.write(b"hi").unwrap();
/// let (_, cached) = capture.finish();
///
/// assert_eq!(cached.status(), StatusCode::Created);
/// assert_eq!(cached.body().as_ref(), b"hi");
/// assert_eq!(out.body_bytes().as_ref(), b"hi");
/// ```
#[derive(Debug)]
pub struct ResponseCapture<W> {
    inner: W,
    status: StatusCode,
    headers: Headers,
    body: BytesMut,
    body_started: bool,
}

impl<W: ResponseWriter> ResponseCapture<W> {
    /// Starts recording; the copy begins from `inner`'s current status and
    /// headers.
    pub fn new(inner: W) -> Self {
        Self {
            status: inner.status(),
            headers: inner.headers().clone(),
            inner,
            body: BytesMut::new(),
            body_started: false,
        }
    }

    /// Bytes recorded so far.
    pub fn recorded_len(&self) -> usize {
        self.body.len()
    }

    /// Stops recording, returning the inner writer and the copy.
    pub fn finish(self) -> (W, CachedResponse) {
        let cached = CachedResponse::new(self.status, &self.headers, self.body.freeze());
        (self.inner, cached)
    }
}

impl<W: ResponseWriter> ResponseWriter for ResponseCapture<W> {
    fn write_status(&mut self, status: StatusCode) {
        if !self.body_started {
            self.status = status;
        }
        self.inner.write_status(status);
    }

    fn write_header(&mut self, name: &str, value: &str) {
        if !self.body_started {
            self.headers.insert(name, value);
        }
        self.inner.write_header(name, value);
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.body_started = true;
        let written = self.inner.write(chunk)?;
        self.body.put_slice(&chunk[..written]);
        Ok(written)
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Response;

    // Accepts at most `limit` bytes per write and fails once `fail_after` writes happened.
    struct Choppy {
        out: Response,
        limit: usize,
        writes: usize,
        fail_after: usize,
    }

    impl ResponseWriter for Choppy {
        fn write_status(&mut self, status: StatusCode) {
            self.out.write_status(status);
        }

        fn write_header(&mut self, name: &str, value: &str) {
            self.out.write_header(name, value);
        }

        fn write(&mut self, chunk: &[u8]) -> io::Result<usize> {
            if self.writes == self.fail_after {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.writes += 1;
            let n = chunk.len().min(self.limit);
            self.out.write(&chunk[..n])
        }

        fn status(&self) -> StatusCode {
            self.out.status()
        }

        fn headers(&self) -> &Headers {
            self.out.headers()
        }
    }

    #[test]
    fn forwards_and_records() {
        let mut out = Response::default();
        let mut capture = ResponseCapture::new(&mut out);
        capture.write_status(StatusCode::Accepted);
        capture.write_header("X-A", "1");
        capture.write_header("X-A", "2");
        capture.write(b"he").unwrap();
        capture.write(b"llo").unwrap();
        let (_, cached) = capture.finish();

        assert_eq!(out.status(), StatusCode::Accepted);
        assert_eq!(out.body_bytes().as_ref(), b"hello");
        assert_eq!(cached.status(), StatusCode::Accepted);
        assert_eq!(cached.header_values("x-a"), ["1", "2"]);
        assert_eq!(cached.body().as_ref(), b"hello");
    }

    #[test]
    fn headers_freeze_at_first_body_byte() {
        let mut out = Response::default();
        let mut capture = ResponseCapture::new(&mut out);
        capture.write_header("X-Early", "yes");
        capture.write(b"body").unwrap();
        capture.write_header("X-Late", "yes");
        capture.write_status(StatusCode::InternalServerError);
        let (_, cached) = capture.finish();

        assert_eq!(cached.status(), StatusCode::Ok);
        assert_eq!(cached.header_values("x-early"), ["yes"]);
        assert!(cached.header_values("x-late").is_empty());
        // The inner writer still saw everything.
        assert!(out.headers().contains("x-late"));
        assert_eq!(out.status(), StatusCode::InternalServerError);
    }

    #[test]
    fn records_only_accepted_bytes() {
        let sink = Choppy {
            out: Response::default(),
            limit: 3,
            writes: 0,
            fail_after: 1,
        };
        let mut capture = ResponseCapture::new(sink);
        assert_eq!(capture.write(b"abcdef").unwrap(), 3);
        assert!(capture.write(b"ghi").is_err());
        assert_eq!(capture.recorded_len(), 3);
        let (sink, cached) = capture.finish();
        assert_eq!(cached.body().as_ref(), b"abc");
        assert_eq!(sink.out.body_bytes().as_ref(), b"abc");
    }

    #[test]
    fn starts_from_inner_state() {
        let mut out = Response::new(StatusCode::NoContent).header("X-Pre", "1");
        let capture = ResponseCapture::new(&mut out);
        let (_, cached) = capture.finish();
        assert_eq!(cached.status(), StatusCode::NoContent);
        assert_eq!(cached.header_values("x-pre"), ["1"]);
        assert!(cached.body().is_empty());
    }
}
