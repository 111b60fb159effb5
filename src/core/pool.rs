//! Connection pool state.
//!
//! Connections are keyed by a hash of the effective credentials and shared
//! by every request that resolves to the same identity. Creation is
//! coalesced per key: concurrent callers wait on the same cell so only one
//! physical connection is ever established for a hash. Active proxies and
//! consecutive refusals live behind one lock; crossing the refusal threshold
//! cancels the pool's fatal token.
use std::{
    collections::HashMap as StdHashMap,
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use scc::{HashMap, hash_map::Entry};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics::{set_active_proxies, set_pooled_connections},
    ports::{BackendConnection, BackendError, BackendResult, ProxyInterface},
};

/// Consecutive refusals after which the pool is considered unrecoverable.
pub const MAX_CONSECUTIVE_REFUSALS: u32 = 10;

type ConnectionCell = Arc<OnceCell<Arc<PooledConnection>>>;

/// The ceiling on simultaneously active proxies was reached.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Connection pool exhausted: {active}/{max} proxies active")]
pub struct PoolExhausted {
    pub active: usize,
    pub max: usize,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pooled_connections: usize,
    pub active_proxies: usize,
    pub max_connections: usize,
    pub consecutive_refusals: u32,
}

#[derive(Debug, Default)]
struct PoolCounters {
    active_proxies: usize,
    consecutive_refusals: u32,
}

/// A backend connection shared by all requests with the same credentials,
/// plus the registry of proxies opened on it.
pub struct PooledConnection {
    credentials_hash: String,
    endpoint: String,
    connection: Arc<dyn BackendConnection>,
    proxies: Mutex<StdHashMap<u64, Arc<dyn ProxyInterface>>>,
    next_proxy_id: AtomicU64,
    closed: AtomicBool,
}

impl PooledConnection {
    pub fn new(
        credentials_hash: impl Into<String>,
        endpoint: impl Into<String>,
        connection: Arc<dyn BackendConnection>,
    ) -> Self {
        Self {
            credentials_hash: credentials_hash.into(),
            endpoint: endpoint.into(),
            connection,
            proxies: Mutex::new(StdHashMap::new()),
            next_proxy_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn credentials_hash(&self) -> &str {
        &self.credentials_hash
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn open_proxy(&self) -> BackendResult<Arc<dyn ProxyInterface>> {
        self.connection.open_proxy()
    }

    /// Track a proxy so it can be cancelled when the connection is torn down.
    pub fn register_proxy(&self, proxy: Arc<dyn ProxyInterface>) -> u64 {
        let id = self.next_proxy_id.fetch_add(1, Ordering::Relaxed);
        self.proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, proxy);
        id
    }

    pub fn deregister_proxy(&self, id: u64) -> Option<Arc<dyn ProxyInterface>> {
        self.proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel in-flight requests on every registered proxy, then release and
    /// dispose the backend connection. Only the first call does any work.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let proxies: Vec<Arc<dyn ProxyInterface>> = self
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, proxy)| proxy)
            .collect();

        for proxy in &proxies {
            proxy.cancel_all_requests();
        }

        self.connection.release();
        self.connection.dispose();

        tracing::debug!(
            credentials_hash = %self.credentials_hash,
            endpoint = %self.endpoint,
            cancelled_proxies = proxies.len(),
            "Pooled connection shut down"
        );
        true
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("credentials_hash", &self.credentials_hash)
            .field("endpoint", &self.endpoint)
            .field("proxies", &self.proxy_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reservation of one active-proxy slot, released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<ConnectionPool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release_slot();
    }
}

pub struct ConnectionPool {
    connections: HashMap<String, ConnectionCell>,
    counters: Mutex<PoolCounters>,
    max_connections: usize,
    fatal: CancellationToken,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            counters: Mutex::new(PoolCounters::default()),
            max_connections,
            fatal: CancellationToken::new(),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Token cancelled once refusals cross [`MAX_CONSECUTIVE_REFUSALS`].
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_cancelled()
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, PoolCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve an active-proxy slot or count a refusal.
    pub fn try_acquire_slot(self: &Arc<Self>) -> Result<SlotGuard, PoolExhausted> {
        let mut counters = self.counters();

        if counters.active_proxies >= self.max_connections {
            counters.consecutive_refusals += 1;
            let refusals = counters.consecutive_refusals;
            let active = counters.active_proxies;
            drop(counters);

            tracing::warn!(
                active,
                max = self.max_connections,
                consecutive_refusals = refusals,
                "Refusing proxy: connection pool exhausted"
            );

            if refusals >= MAX_CONSECUTIVE_REFUSALS && !self.fatal.is_cancelled() {
                tracing::error!(
                    consecutive_refusals = refusals,
                    "Connection pool kept refusing proxies, requesting process restart"
                );
                self.fatal.cancel();
            }

            return Err(PoolExhausted {
                active,
                max: self.max_connections,
            });
        }

        counters.active_proxies += 1;
        counters.consecutive_refusals = 0;
        set_active_proxies(counters.active_proxies);
        drop(counters);

        Ok(SlotGuard {
            pool: Arc::clone(self),
        })
    }

    fn release_slot(&self) {
        let mut counters = self.counters();
        counters.active_proxies = counters.active_proxies.saturating_sub(1);
        set_active_proxies(counters.active_proxies);
    }

    /// Return the pooled connection for `hash`, establishing it with
    /// `connect` when absent. Concurrent callers for the same hash share a
    /// single `connect` invocation. A failed connect leaves the entry empty
    /// and the next caller retries on it.
    pub async fn get_or_create<F, Fut>(
        &self,
        hash: &str,
        endpoint: &str,
        connect: F,
    ) -> BackendResult<Arc<PooledConnection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<Arc<dyn BackendConnection>>>,
    {
        let cell = self.cell_for(hash).await;

        let pooled = cell
            .get_or_try_init(|| async move {
                let connection = connect().await?;
                tracing::info!(credentials_hash = %hash, endpoint, "Created pooled connection");
                Ok::<_, BackendError>(Arc::new(PooledConnection::new(hash, endpoint, connection)))
            })
            .await;

        let pooled = Arc::clone(pooled?);
        set_pooled_connections(self.live_connections());
        Ok(pooled)
    }

    async fn cell_for(&self, hash: &str) -> ConnectionCell {
        match self.connections.entry_async(hash.to_string()).await {
            Entry::Occupied(mut entry) => {
                let cell = Arc::clone(entry.get());
                if cell.get().is_some_and(|pooled| pooled.is_closed()) {
                    let fresh: ConnectionCell = Arc::new(OnceCell::new());
                    *entry.get_mut() = Arc::clone(&fresh);
                    fresh
                } else {
                    cell
                }
            }
            Entry::Vacant(entry) => {
                let cell: ConnectionCell = Arc::new(OnceCell::new());
                entry.insert_entry(Arc::clone(&cell));
                cell
            }
        }
    }

    /// Entries holding an open connection. Cells still connecting, or left
    /// empty by a failed connect, are not counted.
    fn live_connections(&self) -> usize {
        let mut live = 0;
        self.connections.iter_sync(|_, cell| {
            if cell.get().is_some_and(|pooled| !pooled.is_closed()) {
                live += 1;
            }
            true
        });
        live
    }

    /// Pooled connection currently registered for `hash`.
    pub async fn get(&self, hash: &str) -> Option<Arc<PooledConnection>> {
        let cell = self
            .connections
            .get_async(hash)
            .await
            .map(|entry| Arc::clone(entry.get()))?;
        cell.get().cloned()
    }

    /// Unregister `connection` if it is still the entry for its hash.
    pub async fn remove(&self, connection: &Arc<PooledConnection>) -> bool {
        let hash = connection.credentials_hash().to_string();
        let removed = match self.connections.entry_async(hash).await {
            Entry::Occupied(entry) => {
                let current = entry.get().get().is_some_and(|pooled| Arc::ptr_eq(pooled, connection));
                if current {
                    entry.remove();
                }
                current
            }
            Entry::Vacant(_) => false,
        };

        if removed {
            set_pooled_connections(self.live_connections());
        }
        removed
    }

    /// Shut down and forget every pooled connection.
    pub async fn close_all(&self) -> usize {
        let mut drained = Vec::new();
        self.connections
            .retain_async(|_, cell| {
                if let Some(pooled) = cell.get() {
                    drained.push(Arc::clone(pooled));
                }
                false
            })
            .await;

        let closed = drained.iter().filter(|pooled| pooled.shutdown()).count();
        set_pooled_connections(0);
        tracing::info!(closed, "Closed all pooled connections");
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let counters = self.counters();
        PoolStats {
            pooled_connections: self.live_connections(),
            active_proxies: counters.active_proxies,
            max_connections: self.max_connections,
            consecutive_refusals: counters.consecutive_refusals,
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
