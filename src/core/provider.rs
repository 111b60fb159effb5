//! Connection / proxy provider.
//!
//! Resolves effective credentials against the configured app servers, pools
//! one backend connection per credential identity and hands out proxy
//! handles that release their pool slot when dropped.
use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{
    config::{AppServerConfig, models::normalize_endpoint},
    core::{
        checksum::ChecksumService,
        pool::{ConnectionPool, PoolExhausted, PooledConnection, SlotGuard},
    },
    metrics::increment_refusal,
    models::ProcedureCredentials,
    ports::{
        BackendConnector, BackendError, BackendResult, ConnectionSettings, ParameterSet,
        ProxyInterface, RequestContext,
    },
};

const DEFAULT_APP_ID: &str = "default";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("Unknown app server '{0}'")]
    UnknownAppServer(String),

    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Credentials after merging caller overrides with configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub app_server: String,
    pub endpoint: String,
    pub app_id: String,
    pub username: String,
    pub password: String,
    pub procedure_prefix: Option<String>,
}

impl ResolvedCredentials {
    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: self.endpoint.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            app_id: self.app_id.clone(),
        }
    }
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("app_server", &self.app_server)
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("username", &self.username)
            .field("procedure_prefix", &self.procedure_prefix)
            .finish_non_exhaustive()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

/// Proxy that prepends a path prefix to procedure names not already
/// carrying it.
struct PrefixedProxy {
    inner: Arc<dyn ProxyInterface>,
    prefix: String,
}

impl PrefixedProxy {
    fn new(inner: Arc<dyn ProxyInterface>, prefix: &str) -> Self {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        Self { inner, prefix }
    }

    fn prefixed(&self, procedure: &str) -> String {
        if procedure.starts_with(&self.prefix) {
            procedure.to_string()
        } else {
            format!("{}{}", self.prefix, procedure)
        }
    }
}

impl ProxyInterface for PrefixedProxy {
    fn run_procedure(
        &self,
        procedure: &str,
        parameters: &mut ParameterSet,
    ) -> BackendResult<Box<dyn RequestContext>> {
        let procedure = self.prefixed(procedure);
        tracing::debug!(procedure = %procedure, prefix = %self.prefix, "Running prefixed procedure");
        self.inner.run_procedure(&procedure, parameters)
    }

    fn cancel_all_requests(&self) {
        self.inner.cancel_all_requests();
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

/// A proxy interface bound to a pooled connection. Dropping the handle
/// disposes the proxy and frees its pool slot.
pub struct ProxyHandle {
    proxy: Arc<dyn ProxyInterface>,
    connection: Arc<PooledConnection>,
    registration: u64,
    _slot: SlotGuard,
}

impl ProxyHandle {
    pub fn proxy(&self) -> Arc<dyn ProxyInterface> {
        Arc::clone(&self.proxy)
    }

    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.connection
    }

    pub fn credentials_hash(&self) -> &str {
        self.connection.credentials_hash()
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.connection.deregister_proxy(self.registration);
        self.proxy.dispose();
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("connection", &self.connection)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

pub struct ProxyProvider {
    connector: Arc<dyn BackendConnector>,
    pool: Arc<ConnectionPool>,
    app_servers: HashMap<String, AppServerConfig>,
    checksum: ChecksumService,
}

impl ProxyProvider {
    pub fn new(
        connector: Arc<dyn BackendConnector>,
        pool: Arc<ConnectionPool>,
        app_servers: HashMap<String, AppServerConfig>,
        checksum: ChecksumService,
    ) -> Self {
        Self {
            connector,
            pool,
            app_servers,
            checksum,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Merge caller credentials with the configuration of their app server.
    /// Caller values win; username and password are taken from configuration
    /// together when either one is missing.
    pub fn resolve_credentials(
        &self,
        credentials: &ProcedureCredentials,
    ) -> ProviderResult<ResolvedCredentials> {
        let app_server = credentials.app_server_or_default();
        let config = self
            .app_servers
            .get(app_server)
            .ok_or_else(|| ProviderError::UnknownAppServer(app_server.to_string()))?;

        let endpoint = match non_blank(credentials.endpoint.as_deref()) {
            Some(endpoint) => normalize_endpoint(endpoint),
            None => config.normalized_endpoint(),
        };

        let app_id = non_blank(credentials.app_id.as_deref())
            .or_else(|| non_blank(config.app_id.as_deref()))
            .unwrap_or(DEFAULT_APP_ID)
            .to_string();

        let (username, password) = match (
            non_blank(credentials.username.as_deref()),
            non_blank(credentials.password.as_deref()),
        ) {
            (Some(username), Some(password)) => (username.to_string(), password.to_string()),
            _ => (
                config.username.clone().unwrap_or_default(),
                config.password.clone().unwrap_or_default(),
            ),
        };

        let procedure_prefix = non_blank(credentials.procedure_prefix.as_deref())
            .or_else(|| non_blank(config.path_prefix.as_deref()))
            .map(str::to_string);

        Ok(ResolvedCredentials {
            app_server: app_server.to_string(),
            endpoint,
            app_id,
            username,
            password,
            procedure_prefix,
        })
    }

    /// Pool identity of resolved credentials.
    pub fn credentials_hash(&self, credentials: &ResolvedCredentials) -> String {
        self.checksum.generate(&format!(
            "${}${}${}${}$",
            credentials.app_server, credentials.endpoint, credentials.username, credentials.password
        ))
    }

    /// Open a proxy on the pooled connection for `credentials`, creating the
    /// connection when needed. A failure to open the proxy closes the
    /// connection before the error is returned.
    pub async fn create_proxy_instance(
        &self,
        credentials: &ProcedureCredentials,
    ) -> ProviderResult<ProxyHandle> {
        let resolved = self.resolve_credentials(credentials)?;
        let hash = self.credentials_hash(&resolved);

        let slot = self.pool.try_acquire_slot().inspect_err(|_| {
            increment_refusal("pool_exhausted");
        })?;

        let settings = resolved.settings();
        let connector = Arc::clone(&self.connector);
        let connection = self
            .pool
            .get_or_create(&hash, &resolved.endpoint, || async move {
                connector.connect(&settings).await
            })
            .await?;

        tracing::debug!(
            app_server = %resolved.app_server,
            endpoint = %resolved.endpoint,
            credentials_hash = %hash,
            "Retrieved pooled connection"
        );

        let proxy = match connection.open_proxy() {
            Ok(proxy) => proxy,
            Err(error) => {
                tracing::warn!(
                    credentials_hash = %hash,
                    error = %error,
                    "Failed to open proxy, closing connection"
                );
                self.close_connection(&connection).await;
                return Err(error.into());
            }
        };

        let proxy: Arc<dyn ProxyInterface> = match resolved.procedure_prefix.as_deref() {
            Some(prefix) => Arc::new(PrefixedProxy::new(proxy, prefix)),
            None => proxy,
        };
        let registration = connection.register_proxy(Arc::clone(&proxy));

        Ok(ProxyHandle {
            proxy,
            connection,
            registration,
            _slot: slot,
        })
    }

    /// Tear down a pooled connection. Returns whether this call closed it.
    pub async fn close_connection(&self, connection: &Arc<PooledConnection>) -> bool {
        let removed = self.pool.remove(connection).await;
        let shut_down = connection.shutdown();

        if removed || shut_down {
            tracing::info!(
                credentials_hash = %connection.credentials_hash(),
                endpoint = %connection.endpoint(),
                "Closed pooled connection"
            );
        }
        removed || shut_down
    }

    /// Tear down the connection a proxy handle was opened on.
    pub async fn close_proxy(&self, handle: &ProxyHandle) -> bool {
        self.close_connection(handle.connection()).await
    }
}

impl fmt::Debug for ProxyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyProvider")
            .field("pool", &self.pool)
            .field("app_servers", &self.app_servers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
