//! Configuration data structures for the procedure gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files
//! and carry defaults so minimal configs stay short.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::DEFAULT_APP_SERVER;

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    32
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connection details of one app server.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct AppServerConfig {
    /// Host and port, with or without the `http://` scheme
    pub endpoint: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Path prepended to procedure names that are not already prefixed
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl AppServerConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Endpoint with an `http://` scheme.
    pub fn normalized_endpoint(&self) -> String {
        normalize_endpoint(&self.endpoint)
    }
}

/// Prepend `http://` unless the endpoint already names a scheme.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OpenEdgeConfig {
    /// Ceiling on simultaneously active proxy interfaces
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Timeout applied when a request does not set one; 0 disables it
    #[serde(default)]
    pub default_timeout_ms: u64,
    /// App servers keyed by id
    #[serde(default)]
    pub app_servers: HashMap<String, AppServerConfig>,
}

impl Default for OpenEdgeConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            default_timeout_ms: 0,
            app_servers: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Selects the caching executor at construction
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            spans: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub openedge: OpenEdgeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Configuration of `app_server`, if declared.
    pub fn app_server(&self, app_server: &str) -> Option<&AppServerConfig> {
        self.openedge.app_servers.get(app_server)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            openedge: OpenEdgeConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for [`ServerConfig`]
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    max_connections: Option<usize>,
    default_timeout_ms: u64,
    app_servers: HashMap<String, AppServerConfig>,
    cache: Option<CacheConfig>,
    logging: Option<LoggingConfig>,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn default_timeout_ms(mut self, timeout: u64) -> Self {
        self.default_timeout_ms = timeout;
        self
    }

    pub fn app_server(mut self, id: impl Into<String>, config: AppServerConfig) -> Self {
        self.app_servers.insert(id.into(), config);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    pub fn build(self) -> Result<ServerConfig, String> {
        if !self.app_servers.contains_key(DEFAULT_APP_SERVER) {
            return Err(format!(
                "An app server named '{DEFAULT_APP_SERVER}' must be configured"
            ));
        }

        Ok(ServerConfig {
            listen_addr: self.listen_addr.unwrap_or_else(default_listen_addr),
            openedge: OpenEdgeConfig {
                max_connections: self.max_connections.unwrap_or_else(default_max_connections),
                default_timeout_ms: self.default_timeout_ms,
                app_servers: self.app_servers,
            },
            cache: self.cache.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
        })
    }
}

/// Commented starter configuration written by `init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# OpenEdge connector configuration
listen_addr = "0.0.0.0:8080"

[openedge]
# Maximum number of proxy interfaces in use at the same time
max_connections = 32
# Timeout for requests that do not set one (milliseconds, 0 disables)
default_timeout_ms = 0

# App servers are selected by the `creds.app` field of a request
[openedge.app_servers.default]
endpoint = "localhost:5162"
app_id = "default"
# username = "user"
# password = "secret"
# path_prefix = "api/"

[cache]
enabled = true
max_entries = 10000

[logging]
level = "info"
json = false
"#;
