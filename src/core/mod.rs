pub mod cache;
pub mod checksum;
pub mod executor;
pub mod parameters;
pub mod parser;
pub mod pool;
pub mod provider;

use std::{sync::Arc, time::Duration};

pub use cache::{CACHE_PATH_PREFIX, CachedExecutor, cache_key};
pub use checksum::ChecksumService;
pub use executor::{ExecutionResult, OpenEdgeExecutor, ProcedureError, ProcedureExecutor};
pub use parameters::{FilteredParameters, ParameterError, ParameterService};
pub use parser::ProcedureParser;
pub use pool::{ConnectionPool, PoolExhausted, PoolStats};
pub use provider::{ProviderError, ProxyHandle, ProxyProvider};

use crate::{
    config::ServerConfig,
    ports::{BackendConnector, ResponseCache},
};

/// Assemble the executor described by `config`, wrapping it in the caching
/// decorator when `[cache] enabled` is set.
pub fn build_executor(
    config: &ServerConfig,
    connector: Arc<dyn BackendConnector>,
    pool: Arc<ConnectionPool>,
    cache: Arc<dyn ResponseCache>,
) -> Arc<dyn ProcedureExecutor> {
    let checksum = ChecksumService::new();
    let provider = ProxyProvider::new(
        connector,
        pool,
        config.openedge.app_servers.clone(),
        checksum,
    );

    let executor = OpenEdgeExecutor::new(
        provider,
        ParameterService::new(checksum),
        ProcedureParser::new(),
    )
    .with_default_timeout(Duration::from_millis(config.openedge.default_timeout_ms));

    if config.cache.enabled {
        tracing::info!(max_entries = config.cache.max_entries, "Response cache enabled");
        Arc::new(CachedExecutor::new(executor, cache))
    } else {
        tracing::info!("Response cache disabled");
        Arc::new(executor)
    }
}
