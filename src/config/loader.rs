use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Load configuration from a file using the config crate.
/// Supports TOML, YAML and JSON, picked by extension.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously.
///
/// `OPENEDGE__`-prefixed environment variables override file values, e.g.
/// `OPENEDGE__OPENEDGE__MAX_CONNECTIONS=64`.
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(Environment::with_prefix("OPENEDGE").separator("__"))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"

[openedge]
max_connections = 8

[openedge.app_servers.default]
endpoint = "appserver:5162"
app_id = "sales"
path_prefix = "api/"

[cache]
enabled = false
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.openedge.max_connections, 8);
        assert!(!config.cache.enabled);

        let default = config.app_server("default").unwrap();
        assert_eq!(default.normalized_endpoint(), "http://appserver:5162");
        assert_eq!(default.app_id.as_deref(), Some("sales"));
        assert_eq!(default.path_prefix.as_deref(), Some("api/"));
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "openedge": {
    "app_servers": {
      "default": { "endpoint": "http://appserver:5162" },
      "erp": { "endpoint": "erp:5162", "username": "svc", "password": "pw" }
    }
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.openedge.app_servers.len(), 2);
        assert_eq!(config.openedge.max_connections, 32);
        assert!(config.cache.enabled);
        assert_eq!(
            config.app_server("erp").unwrap().username.as_deref(),
            Some("svc")
        );
    }
}
