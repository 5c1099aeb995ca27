//! Cache key derivation.
//!
//! A key is `METHOD path?query`, where the query has been canonicalized:
//! names sorted, values within a name sorted, every component
//! percent-decoded and re-encoded so that equivalent spellings collapse.
//! Requests other than `GET` also carry their body. Keys longer than
//! [`MAX_KEY_LEN`] are replaced by a fixed-length digest.

use std::{collections::BTreeMap, fmt};

use sha2::{Digest, Sha256};

use crate::http::{Method, Request};

/// Longest key kept verbatim, in characters.
pub const MAX_KEY_LEN: usize = 200;

const DIGEST_TAG: &str = "sha256:";

/// A canonical cache key.
///
/// # Examples
///
/// ```
/// use pagecache::cache::CacheKey;
/// use pagecache::http::{Method, Request};
///
/// let a = CacheKey::from_request(&Request::new(Method::Get, "/p?b=2&a=1"));
/// let b = CacheKey::from_request(&Request::new(Method::Get, "/p?a=1&b=2"));
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "GET /p?a=1&b=2");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key for `request`.
    pub fn from_request(request: &Request) -> Self {
        derive_key(
            request.method(),
            request.path(),
            request.query_string(),
            request.body(),
        )
        .unwrap_or_else(|| {
            let mut key = format!("{} {}", request.method(), request.target());
            fold_body(&mut key, request.method(), request.body());
            Self::bounded(key)
        })
    }

    /// Wraps an already-built key, digesting it when it is longer than
    /// [`MAX_KEY_LEN`] characters.
    pub fn bounded(raw: String) -> Self {
        if raw.chars().count() <= MAX_KEY_LEN {
            return Self(raw);
        }
        let digest = Sha256::digest(raw.as_bytes());
        Self(format!("{DIGEST_TAG}{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> String {
        key.0
    }
}

/// Builds the canonical key from request parts.
///
/// Returns `None` when the query cannot be canonicalized (a component does
/// not decode to UTF-8); [`CacheKey::from_request`] then falls back to the
/// raw request target, still folding in the body.
pub fn derive_key(
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> Option<CacheKey> {
    let mut key = format!("{method} {path}");

    if let Some(query) = query {
        let canonical = canonical_query(query)?;
        if !canonical.is_empty() {
            key.push('?');
            key.push_str(&canonical);
        }
    }

    fold_body(&mut key, method, body);
    Some(CacheKey::bounded(key))
}

fn fold_body(key: &mut String, method: &Method, body: &[u8]) {
    if *method != Method::Get {
        key.push('#');
        key.push_str(&urlencoding::encode_binary(body));
    }
}

/// Sorts query parameters by name, then by value, and re-joins them.
///
/// ```
/// use pagecache::cache::key::canonical_query;
///
/// assert_eq!(canonical_query("b=2&a=3&a=1").as_deref(), Some("a=1&a=3&b=2"));
/// assert_eq!(canonical_query("q=hello+world").as_deref(), Some("q=hello%20world"));
/// assert_eq!(canonical_query("bad=%FF"), None);
/// ```
pub fn canonical_query(query: &str) -> Option<String> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(name)?)
            .or_default()
            .push(decode_component(value)?);
    }

    let mut pairs = Vec::new();
    for (name, mut values) in params {
        values.sort();
        let name = urlencoding::encode(&name);
        for value in values {
            pairs.push(format!("{name}={}", urlencoding::encode(&value)));
        }
    }
    Some(pairs.join("&"))
}

fn decode_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|s| s.into_owned())
}
