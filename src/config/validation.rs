use std::net::SocketAddr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::models::{AppServerConfig, ServerConfig},
    models::DEFAULT_APP_SERVER,
};

const MAX_APP_SERVER_ID_LEN: usize = 24;

static APP_SERVER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w-]+$").expect("valid regex"));

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.openedge.max_connections == 0 {
            errors.push(ValidationError::InvalidField {
                field: "openedge.max_connections".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if !config.openedge.app_servers.contains_key(DEFAULT_APP_SERVER) {
            errors.push(ValidationError::MissingField {
                field: format!("openedge.app_servers.{DEFAULT_APP_SERVER}"),
            });
        }

        for (id, app_server) in &config.openedge.app_servers {
            errors.extend(Self::validate_app_server(id, app_server));
        }

        if config.cache.enabled && config.cache.max_entries == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.max_entries".to_string(),
                message: "Must be greater than 0 when the cache is enabled".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_app_server(id: &str, config: &AppServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if id.len() > MAX_APP_SERVER_ID_LEN || !APP_SERVER_ID.is_match(id) {
            errors.push(ValidationError::InvalidField {
                field: format!("openedge.app_servers.{id}"),
                message: format!(
                    "App server ids must be at most {MAX_APP_SERVER_ID_LEN} alphanumeric characters, dashes or underscores"
                ),
            });
        }

        if config.endpoint.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("openedge.app_servers.{id}.endpoint"),
            });
        }

        let has_username = config.username.as_deref().is_some_and(|u| !u.is_empty());
        let has_password = config.password.as_deref().is_some_and(|p| !p.is_empty());
        if has_password && !has_username {
            errors.push(ValidationError::InvalidField {
                field: format!("openedge.app_servers.{id}.password"),
                message: "A password requires a username".to_string(),
            });
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid_config() -> ServerConfig {
        ServerConfig::builder()
            .listen_addr("127.0.0.1:8080")
            .app_server("default", AppServerConfig::new("localhost:5162"))
            .build()
            .unwrap()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_missing_default_app_server() {
        let mut config = minimal_valid_config();
        config.openedge.app_servers.clear();
        config
            .openedge
            .app_servers
            .insert("erp".to_string(), AppServerConfig::new("erp:5162"));

        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_bad_app_server_entries() {
        let mut config = minimal_valid_config();
        config
            .openedge
            .app_servers
            .insert("has space".to_string(), AppServerConfig::new("x:1"));
        config
            .openedge
            .app_servers
            .insert("empty".to_string(), AppServerConfig::new("  "));

        let error = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(error.to_string().contains("Found 2 validation errors"));
    }

    #[test]
    fn validate_rejects_zero_max_connections_and_bad_listen_addr() {
        let mut config = minimal_valid_config();
        config.openedge.max_connections = 0;
        config.listen_addr = "not-an-address".to_string();

        let error = ServerConfigValidator::validate(&config).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("max_connections"));
        assert!(message.contains("not-an-address"));
    }
}
