//! The persisted response record and expiration descriptors.

use std::{io, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{codec, error::StoreResult};
use crate::http::{Headers, ResponseWriter, StatusCode};

/// How long a stored value should live.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use pagecache::cache::Expiration;
///
/// assert_eq!(Expiration::from(Duration::ZERO), Expiration::Default);
/// assert_eq!(
///     Expiration::from(Duration::from_secs(5)),
///     Expiration::After(Duration::from_secs(5))
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// The store's configured baseline expiration.
    #[default]
    Default,
    /// Never expires.
    Forever,
    /// Expires after the given duration.
    After(Duration),
}

impl From<Duration> for Expiration {
    fn from(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Self::Default
        } else {
            Self::After(ttl)
        }
    }
}

/// A captured response: the only shape the middleware persists.
///
/// Headers are grouped by name (first-seen spelling, case-insensitive) with
/// their values in write order, so replay reproduces multi-value headers
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    status: StatusCode,
    headers: Vec<(String, Vec<String>)>,
    body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: &Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: headers.grouped(),
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &[(String, Vec<String>)] {
        &self.headers
    }

    /// All values recorded for `name`, matched case-insensitively.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }

    /// Appends a header value, grouping it under an existing name.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, values)) => values.push(value.into()),
            None => self.headers.push((name.to_owned(), vec![value.into()])),
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Only `2xx` responses are ever written to a store.
    pub fn is_cacheable(&self) -> bool {
        self.status.is_success()
    }

    /// Writes status, every header value in order, and the body onto `out`.
    ///
    /// # Errors
    ///
    /// Propagates a body write failure from `out`.
    pub fn replay<W: ResponseWriter + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        out.write_status(self.status);
        for (name, values) in &self.headers {
            for value in values {
                out.write_header(name, value);
            }
        }
        if !self.body.is_empty() {
            out.write(&self.body)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> StoreResult<Bytes> {
        codec::encode(self)
    }

    pub fn decode(raw: &[u8]) -> StoreResult<Self> {
        codec::decode(raw)
    }
}
