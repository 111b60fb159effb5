//! Caching decorator for procedure executors.
//!
//! Requests with a positive `cache` read through a [`ResponseCache`] keyed
//! by procedure and parameter fingerprint. Cache failures never fail a
//! request: reads degrade to misses and writes happen in the background.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        executor::{ExecutionResult, ProcedureExecutor},
        parser::ProcedureParser,
    },
    metrics::increment_cache_lookup,
    models::{ProcedureRequest, ProcedureResponse},
    ports::ResponseCache,
};

/// Prefix shared by every cached procedure response.
pub const CACHE_PATH_PREFIX: &str = "OpenEdge:Procedures:";

/// Cache key for `procedure`, suffixed with the parameter fingerprint when
/// there is one.
pub fn cache_key(procedure: &str, parameter_hash: Option<&str>) -> String {
    match parameter_hash {
        Some(hash) => format!("{CACHE_PATH_PREFIX}{procedure}:{hash}"),
        None => format!("{CACHE_PATH_PREFIX}{procedure}"),
    }
}

pub struct CachedExecutor<E> {
    inner: E,
    cache: Arc<dyn ResponseCache>,
    parser: ProcedureParser,
}

impl<E: ProcedureExecutor> CachedExecutor<E> {
    pub fn new(inner: E, cache: Arc<dyn ResponseCache>) -> Self {
        Self {
            inner,
            cache,
            parser: ProcedureParser::new(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    async fn lookup(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(error) => {
                tracing::warn!(cache_key = %key, error = %error, "Cache read failed, treating as miss");
                None
            }
        }
    }

    fn store(&self, key: String, bytes: Bytes, ttl: std::time::Duration) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            if let Err(error) = cache.set(&key, bytes, ttl).await {
                tracing::warn!(cache_key = %key, error = %error, "Cache write failed");
            }
        });
    }
}

#[async_trait]
impl<E: ProcedureExecutor> ProcedureExecutor for CachedExecutor<E> {
    async fn get_procedure(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ProcedureResponse> {
        if request.cache_ttl().is_none() {
            return self.inner.get_procedure(request, parameter_hash, cancel).await;
        }

        let bytes = self.execute_procedure(request, parameter_hash, cancel).await?;
        Ok(self.parser.procedure_response_from_bytes(&bytes)?)
    }

    async fn execute_procedure(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<Bytes> {
        let Some(ttl) = request.cache_ttl() else {
            tracing::info!(procedure = %request.procedure, "Cache BYPASS");
            increment_cache_lookup("bypass");
            return self
                .inner
                .execute_procedure(request, parameter_hash, cancel)
                .await;
        };

        let key = cache_key(&request.procedure, parameter_hash);
        if let Some(bytes) = self.lookup(&key).await {
            tracing::info!(procedure = %request.procedure, cache_key = %key, "Cache HIT");
            increment_cache_lookup("hit");
            return Ok(bytes);
        }

        let mut response = self
            .inner
            .get_procedure(request, parameter_hash, cancel)
            .await?;
        response.last_modified = Some(Utc::now());
        let bytes = self.parser.get_procedure_response_bytes(&response)?;

        self.store(key.clone(), bytes.clone(), ttl);
        tracing::info!(
            procedure = %request.procedure,
            cache_key = %key,
            ttl_secs = ttl.as_secs(),
            "Cache MISS"
        );
        increment_cache_lookup("miss");

        Ok(bytes)
    }
}

impl<E: std::fmt::Debug> std::fmt::Debug for CachedExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedExecutor")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        adapters::memory_cache::InMemoryCache,
        ports::{CacheError, CacheResult},
    };

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcedureExecutor for CountingExecutor {
        async fn get_procedure(
            &self,
            request: &ProcedureRequest,
            _parameter_hash: Option<&str>,
            _cancel: &CancellationToken,
        ) -> ExecutionResult<ProcedureResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ProcedureResponse::new(
                request.procedure.clone(),
                200,
                3,
                json!({ "call": call }),
            ))
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl ResponseCache for BrokenCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<Bytes>> {
            Err(CacheError::Unavailable("offline".into()))
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("offline".into()))
        }
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("orders.p", None), "OpenEdge:Procedures:orders.p");
        assert_eq!(
            cache_key("api/orders.p", Some("ABC123")),
            "OpenEdge:Procedures:api/orders.p:ABC123"
        );
    }

    #[tokio::test]
    async fn test_hit_returns_stored_bytes() {
        let cache = Arc::new(InMemoryCache::new(16));
        let executor = CachedExecutor::new(CountingExecutor::default(), cache.clone());
        let request = ProcedureRequest::new("orders.p").with_cache(60);
        let cancel = CancellationToken::new();

        let first = executor
            .execute_procedure(&request, Some("H"), &cancel)
            .await
            .unwrap();
        let stamped = executor.parser.procedure_response_from_bytes(&first).unwrap();
        assert!(stamped.last_modified.is_some());

        // The write-through runs on a spawned task.
        for _ in 0..50 {
            if !cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = executor
            .execute_procedure(&request, Some("H"), &cancel)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(executor.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bypass_when_cache_disabled_on_request() {
        let cache = Arc::new(InMemoryCache::new(16));
        let executor = CachedExecutor::new(CountingExecutor::default(), cache.clone());
        let cancel = CancellationToken::new();

        for seconds in [0, -1] {
            let request = ProcedureRequest::new("orders.p").with_cache(seconds);
            let response = executor.get_procedure(&request, None, &cancel).await.unwrap();
            assert!(response.last_modified.is_none());
        }

        tokio::task::yield_now().await;
        assert!(cache.is_empty());
        assert_eq!(executor.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_failures_do_not_fail_requests() {
        let executor = CachedExecutor::new(CountingExecutor::default(), Arc::new(BrokenCache));
        let request = ProcedureRequest::new("orders.p").with_cache(30);

        let response = executor
            .get_procedure(&request, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.result, json!({ "call": 1 }));
    }
}
