//! The storage contract every cache backend satisfies.
//!
//! Stores move opaque [`Bytes`]; typed access goes through
//! [`CacheStoreExt`], which runs values through the JSON codec.
//! There is no per-call context argument: every operation is a future, so a
//! caller bounds it with `tokio::time::timeout` or cancels it by dropping it.
//!
//! ## Error contract
//!
//! | Operation   | Absent / expired key      | Live key                        |
//! |-------------|---------------------------|---------------------------------|
//! | `get`       | `CacheMiss`               | value                           |
//! | `set`       | inserted                  | overwritten, expiry reset       |
//! | `add`       | inserted                  | `NotStored`                     |
//! | `replace`   | `NotStored`               | overwritten, expiry reset       |
//! | `delete`    | `CacheMiss`               | removed                         |
//! | `increment` | `CacheMiss`               | new value (wraps at `u64::MAX`) |
//! | `decrement` | `CacheMiss`               | new value (floors at zero)      |
//!
//! `add` must check and insert as one step: of several concurrent `add`s
//! for one key, exactly one succeeds. Backend failures surface as
//! [`StoreError::Unavailable`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use super::{
    codec,
    entry::Expiration,
    error::{StoreError, StoreResult},
};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    async fn set(&self, key: &str, value: Bytes, expiration: Expiration) -> StoreResult<()>;

    async fn add(&self, key: &str, value: Bytes, expiration: Expiration) -> StoreResult<()>;

    async fn replace(&self, key: &str, value: Bytes, expiration: Expiration) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn increment(&self, key: &str, delta: u64) -> StoreResult<u64>;

    async fn decrement(&self, key: &str, delta: u64) -> StoreResult<u64>;

    /// Removes every entry. Maintenance only; never called while serving.
    async fn flush(&self) -> StoreResult<()>;
}

/// Typed helpers over any [`CacheStore`].
#[async_trait]
pub trait CacheStoreExt: CacheStore {
    async fn get_value<T: DeserializeOwned + Send>(&self, key: &str) -> StoreResult<T> {
        let raw = self.get(key).await?;
        codec::decode(&raw)
    }

    async fn set_value<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        expiration: Expiration,
    ) -> StoreResult<()> {
        let raw = codec::encode(value)?;
        self.set(key, raw, expiration).await
    }
}

impl<S: CacheStore + ?Sized> CacheStoreExt for S {}

/// Parses the ASCII decimal counter representation.
pub(crate) fn parse_counter(key: &str, raw: &[u8]) -> StoreResult<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| StoreError::InvalidPayload {
            key: key.to_owned(),
            reason: "value is not an unsigned integer".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_parse_decimal() {
        assert_eq!(parse_counter("k", b"42").unwrap(), 42);
        assert_eq!(parse_counter("k", b" 7\n").unwrap(), 7);
        assert!(matches!(
            parse_counter("k", b"\"text\""),
            Err(StoreError::InvalidPayload { .. })
        ));
        assert!(parse_counter("k", b"-1").is_err());
    }
}
