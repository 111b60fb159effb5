use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors raised by a response cache
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// The cache refused the entry
    #[error("Cache is full ({0} entries)")]
    Full(usize),

    /// The underlying store is unreachable
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Byte-oriented response cache. Failures are never fatal to callers.
#[async_trait]
pub trait ResponseCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()>;
}
