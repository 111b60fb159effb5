use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use openedge_connector::{
    adapters::{InMemoryBackend, InMemoryCache},
    config::{AppServerConfig, CacheConfig, ServerConfig},
    core::{ConnectionPool, ParameterService, ProcedureExecutor, build_executor},
    models::{Parameter, ProcedureRequest},
    ports::{CacheResult, ParameterValue, ResponseCache},
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records every cache call and forwards to an in-memory cache.
struct RecordingCache {
    inner: InMemoryCache,
    reads: Mutex<Vec<String>>,
    writes: mpsc::UnboundedSender<(String, Duration)>,
}

impl RecordingCache {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Duration)>) {
        let (writes, received) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            inner: InMemoryCache::new(64),
            reads: Mutex::new(Vec::new()),
            writes,
        });
        (cache, received)
    }

    fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseCache for RecordingCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.reads.lock().unwrap().push(key.to_string());
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> CacheResult<()> {
        let stored = self.inner.set(key, value, ttl).await;
        let _ = self.writes.send((key.to_string(), ttl));
        stored
    }
}

fn cached_executor(
    backend: &InMemoryBackend,
    cache: Arc<RecordingCache>,
) -> Arc<dyn ProcedureExecutor> {
    let config = ServerConfig::builder()
        .app_server("default", AppServerConfig::new("appserver:5162"))
        .cache(CacheConfig {
            enabled: true,
            max_entries: 64,
        })
        .build()
        .unwrap();

    build_executor(
        &config,
        Arc::new(backend.clone()),
        Arc::new(ConnectionPool::new(8)),
        cache,
    )
}

fn counting_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    backend.register("stock.p", |parameters, _| {
        let item = match parameters.slot(1).map(|slot| &slot.value) {
            Some(ParameterValue::Text(item)) => item.clone(),
            _ => String::new(),
        };
        parameters.set_output(2, ParameterValue::Text(format!("stock of {item}")))
    });
    backend
}

fn stock_request(cache: i64) -> ProcedureRequest {
    ProcedureRequest::new("stock.p")
        .with_cache(cache)
        .with_parameter(Parameter::input(1, json!("bolts")))
        .with_parameter(Parameter::output(2))
}

#[tokio::test]
async fn test_non_positive_cache_never_touches_the_cache() {
    let backend = counting_backend();
    let (cache, mut writes) = RecordingCache::new();
    let executor = cached_executor(&backend, cache.clone());
    let cancel = CancellationToken::new();

    for seconds in [0, -1] {
        executor
            .execute_procedure(&stock_request(seconds), Some("HASH"), &cancel)
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cache.reads().is_empty());
    assert!(writes.try_recv().is_err());
    assert_eq!(backend.invocations().len(), 2);
}

#[tokio::test]
async fn test_miss_stores_under_expected_key_then_hits() {
    let backend = counting_backend();
    let (cache, mut writes) = RecordingCache::new();
    let executor = cached_executor(&backend, cache.clone());
    let cancel = CancellationToken::new();

    let request = stock_request(50);
    let hash = ParameterService::default()
        .get_filtered_parameters(&request.parameters)
        .parameter_hash;
    let expected_key = format!("OpenEdge:Procedures:stock.p:{}", hash.as_deref().unwrap());

    let first = executor
        .execute_procedure(&request, hash.as_deref(), &cancel)
        .await
        .unwrap();

    let (key, ttl) = tokio::time::timeout(Duration::from_secs(1), writes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, expected_key);
    assert_eq!(ttl, Duration::from_secs(50));

    let second = executor
        .execute_procedure(&request, hash.as_deref(), &cancel)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.invocations().len(), 1);
    assert_eq!(cache.reads(), vec![expected_key.clone(), expected_key]);

    let response: serde_json::Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(response["proc"], "stock.p");
    assert_eq!(response["result"], "stock of bolts");
    assert!(response["lastModified"].is_string());
}

#[tokio::test]
async fn test_cache_ttl_is_clamped() {
    let backend = counting_backend();
    let (cache, mut writes) = RecordingCache::new();
    let executor = cached_executor(&backend, cache);

    executor
        .execute_procedure(&stock_request(1_000_000), None, &CancellationToken::new())
        .await
        .unwrap();

    let (key, ttl) = tokio::time::timeout(Duration::from_secs(1), writes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "OpenEdge:Procedures:stock.p");
    assert_eq!(ttl, Duration::from_secs(20_160));
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let backend = InMemoryBackend::new();
    let (cache, mut writes) = RecordingCache::new();
    let executor = cached_executor(&backend, cache.clone());

    let result = executor
        .execute_procedure(
            &ProcedureRequest::new("absent.p").with_cache(30),
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.reads().len(), 1);
    assert!(writes.try_recv().is_err());
}
