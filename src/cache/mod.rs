//! # Response Caching Module
//!
//! Caches upstream answers by request fingerprint so repeated logical requests
//! never reach the rate-limited service.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | TTL cache with hit/miss statistics |
//! | [`CacheConfig`] | TTL, capacity and enablement |
//! | [`CacheBackend`] | Trait for storage backends |
//! | [`MemoryCache`] | In-process LRU backend |
//! | [`NullCache`] | No-op backend used when caching is disabled |
//! | [`FingerprintBuilder`] | Derives a [`Fingerprint`] from a request's identity |
//!
//! ```rust
//! use quota_governor::cache::{CacheConfig, FingerprintBuilder, ResponseCache};
//! use std::time::Duration;
//!
//! # async fn demo() -> quota_governor::Result<()> {
//! let cache = ResponseCache::from_config(CacheConfig::new().with_ttl(Duration::from_secs(3600)));
//! let fp = FingerprintBuilder::new("acme").query("latest product news").mode("twitter").build();
//! cache.put(&fp, &"cached answer".to_string()).await?;
//! assert_eq!(cache.get::<String>(&fp).await?.as_deref(), Some("cached answer"));
//! # Ok(())
//! # }
//! ```

mod backend;
mod key;
mod manager;

pub use backend::{CacheBackend, MemoryCache, NullCache};
pub use key::{Fingerprint, FingerprintBuilder};
pub use manager::{CacheConfig, CacheStats, ResponseCache};
