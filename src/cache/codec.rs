//! The serialization codec for values crossing the store boundary.
//!
//! Stores only ever see bytes. Everything typed goes through these two
//! functions, which encode with `serde_json`. Unsigned integers therefore
//! persist as ASCII decimal, the representation
//! [`CacheStore::increment`](super::CacheStore::increment) operates on.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use super::error::StoreResult;

/// Encodes `value` for storage.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> StoreResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decodes a stored payload.
pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(raw)?)
}
