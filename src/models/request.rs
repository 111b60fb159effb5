//! Inbound procedure requests and their validation rules.
use std::{collections::HashSet, fmt, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::parameter::Parameter;

/// Upper bound for `ProcedureRequest::timeout` (milliseconds).
pub const TIMEOUT_MAX_MS: u64 = 1000 * 60 * 5;
/// Upper bound for `ProcedureRequest::cache` (seconds).
pub const CACHE_MAX_SECS: u64 = 60 * 24 * 14;
/// App server used when the caller does not pick one.
pub const DEFAULT_APP_SERVER: &str = "default";

const MAX_POSITION: u16 = 999;

static PROCEDURE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([\w\-./]{1,223}/)?([\w\-.]{1,32})$").expect("valid regex")
});
static APP_SERVER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w-]+$").expect("valid regex"));
static USERNAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w-]+$").expect("valid regex"));
static PASSWORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w\-@$!%*#?&]+$").expect("valid regex"));

/// Request validation failures, reported to callers as a bad request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestValidationError {
    #[error(
        "procedure name '{0}' must be alphanumeric and may contain dashes, underscores and a dot and can be prefixed by a path"
    )]
    InvalidProcedure(String),

    #[error("parameter position {0} is outside 1..=999")]
    PositionOutOfRange(u16),

    #[error("parameter position {0} is used more than once")]
    DuplicatePosition(u16),

    #[error("cache duration {0} is below -1")]
    InvalidCache(i64),

    #[error("timeout {0} is below -1")]
    InvalidTimeout(i64),

    #[error("invalid credentials field '{field}': {message}")]
    InvalidCredentials {
        field: &'static str,
        message: &'static str,
    },
}

/// Credentials supplied by the caller, merged with configured defaults
/// before a connection is resolved.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureCredentials {
    /// App server identifier in configuration
    #[serde(default, rename = "app", skip_serializing_if = "Option::is_none")]
    pub app_server: Option<String>,
    #[serde(default, rename = "user", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, rename = "pwd", skip_serializing)]
    pub password: Option<String>,
    #[serde(skip)]
    pub procedure_prefix: Option<String>,
    #[serde(skip)]
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub app_id: Option<String>,
}

impl ProcedureCredentials {
    /// Credentials of the anonymous default app server.
    pub fn anonymous() -> Self {
        Self {
            app_server: Some(DEFAULT_APP_SERVER.to_string()),
            ..Self::default()
        }
    }

    pub fn for_app_server(app_server: impl Into<String>) -> Self {
        Self {
            app_server: Some(app_server.into()),
            ..Self::default()
        }
    }

    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// App server id, falling back to the default one.
    pub fn app_server_or_default(&self) -> &str {
        match self.app_server.as_deref() {
            Some(app_server) if !app_server.trim().is_empty() => app_server,
            _ => DEFAULT_APP_SERVER,
        }
    }

    pub fn validate(&self) -> Result<(), RequestValidationError> {
        check_field(
            self.app_server.as_deref(),
            "app",
            24,
            &APP_SERVER_PATTERN,
            "must be at most 24 alphanumeric characters, dashes or underscores",
        )?;
        check_field(
            self.username.as_deref(),
            "user",
            32,
            &USERNAME_PATTERN,
            "must be at most 32 alphanumeric characters, dashes or underscores",
        )?;
        check_field(
            self.password.as_deref(),
            "pwd",
            32,
            &PASSWORD_PATTERN,
            "must be at most 32 alphanumeric characters or -_@$!%*#?&",
        )
    }
}

fn check_field(
    value: Option<&str>,
    field: &'static str,
    max_len: usize,
    pattern: &Regex,
    message: &'static str,
) -> Result<(), RequestValidationError> {
    match value {
        Some(value) if value.chars().count() > max_len || !pattern.is_match(value) => {
            Err(RequestValidationError::InvalidCredentials { field, message })
        }
        _ => Ok(()),
    }
}

impl fmt::Debug for ProcedureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureCredentials")
            .field("app_server", &self.app_server)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("procedure_prefix", &self.procedure_prefix)
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// A declarative procedure call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureRequest {
    #[serde(rename = "proc", default)]
    pub procedure: String,
    #[serde(rename = "parm", default)]
    pub parameters: Vec<Parameter>,
    /// Seconds to cache the response; below 1 bypasses the cache
    #[serde(default)]
    pub cache: i64,
    /// Milliseconds before the call is abandoned; 0 or below disables it
    #[serde(rename = "tw", default)]
    pub timeout: i64,
    #[serde(rename = "creds", default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProcedureCredentials>,
}

impl ProcedureRequest {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_cache(mut self, seconds: i64) -> Self {
        self.cache = seconds;
        self
    }

    pub fn with_timeout(mut self, milliseconds: i64) -> Self {
        self.timeout = milliseconds;
        self
    }

    pub fn with_credentials(mut self, credentials: ProcedureCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Effective timeout, clamped to [`TIMEOUT_MAX_MS`]; `None` when disabled.
    pub fn timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0)
            .then(|| Duration::from_millis((self.timeout as u64).min(TIMEOUT_MAX_MS)))
    }

    /// Cache lifetime, clamped to [`CACHE_MAX_SECS`]; `None` bypasses the cache.
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache > 0).then(|| Duration::from_secs((self.cache as u64).min(CACHE_MAX_SECS)))
    }

    pub fn validate(&self) -> Result<(), RequestValidationError> {
        if !PROCEDURE_PATTERN.is_match(&self.procedure) {
            return Err(RequestValidationError::InvalidProcedure(
                self.procedure.clone(),
            ));
        }

        if self.cache < -1 {
            return Err(RequestValidationError::InvalidCache(self.cache));
        }

        if self.timeout < -1 {
            return Err(RequestValidationError::InvalidTimeout(self.timeout));
        }

        let mut positions = HashSet::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            if parameter.position == 0 || parameter.position > MAX_POSITION {
                return Err(RequestValidationError::PositionOutOfRange(
                    parameter.position,
                ));
            }
            if !positions.insert(parameter.position) {
                return Err(RequestValidationError::DuplicatePosition(
                    parameter.position,
                ));
            }
        }

        if let Some(credentials) = &self.credentials {
            credentials.validate()?;
        }

        Ok(())
    }
}
