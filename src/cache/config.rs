//! Cache configuration.
//!
//! Every field has a default, so a partial document is valid:
//!
//! ```
//! use pagecache::cache::CacheConfig;
//!
//! let config = CacheConfig::from_json(r#"{ "key_prefix": "api", "forget_timeout_ms": 250 }"#).unwrap();
//! assert_eq!(config.key_prefix, "api");
//! assert_eq!(config.forget_timeout().map(|d| d.as_millis()), Some(250));
//! assert!(!config.serialize_requests);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{entry::Expiration, error::ConfigError, memory::InMemoryStore};

/// Prefix applied to every key the middleware writes.
pub const DEFAULT_KEY_PREFIX: &str = "page.cache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prepended to every derived key as `"{prefix}:{key}"`.
    pub key_prefix: String,

    /// TTL for responses the middleware writes. `None` defers to the
    /// store's own default expiration.
    pub expiration_secs: Option<u64>,

    /// Baseline expiration of an [`InMemoryStore`] built from this config.
    /// Zero means entries written with the default never expire.
    pub default_expiration_secs: u64,

    /// How often an [`InMemoryStore`] janitor sweeps expired entries.
    pub cleanup_interval_secs: u64,

    /// Age after which an in-flight computation stops accepting new
    /// waiters. `None` disables the timeout.
    pub forget_timeout_ms: Option<u64>,

    /// Holds one global lock across the whole lookup-and-handle sequence.
    /// Strict ordering at the cost of all cross-request parallelism.
    pub serialize_requests: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            expiration_secs: None,
            default_expiration_secs: 3600,
            cleanup_interval_secs: 60,
            forget_timeout_ms: None,
            serialize_requests: false,
        }
    }
}

impl CacheConfig {
    /// Parses a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or mistyped fields.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The expiration applied when a strategy does not override it.
    pub fn expiration(&self) -> Expiration {
        self.expiration_secs
            .map_or(Expiration::Default, |secs| Duration::from_secs(secs).into())
    }

    pub fn forget_timeout(&self) -> Option<Duration> {
        self.forget_timeout_ms.map(Duration::from_millis)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Builds an in-memory store honoring `default_expiration_secs`.
    pub fn in_memory_store(&self) -> InMemoryStore {
        InMemoryStore::new(Duration::from_secs(self.default_expiration_secs))
    }

    /// Applies the key namespace.
    pub fn namespaced(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{key}", self.key_prefix)
        }
    }
}
