use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured status decoded from a backend return value
/// (`statusCode::title[::description]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureResult {
    pub status_code: u16,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProcedureResult {
    pub fn new(status_code: u16, title: impl Into<String>) -> Self {
        Self {
            status_code,
            title: title.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Response envelope returned for every executed procedure.
///
/// Error envelopes use the same shape and carry `title`/`description`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureResponse {
    #[serde(rename = "proc")]
    pub procedure: String,
    pub status: u16,
    /// Retrieval time, stamped when the response is stored in the cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Backend round-trip time in milliseconds
    #[serde(default)]
    pub origin_time: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProcedureResponse {
    pub fn new(procedure: impl Into<String>, status: u16, origin_time: u64, result: Value) -> Self {
        Self {
            procedure: procedure.into(),
            status,
            last_modified: None,
            origin_time,
            result,
            title: None,
            description: None,
        }
    }

    /// Whether this envelope carries a backend-declared error.
    pub fn is_error(&self) -> bool {
        self.title.is_some() || self.status >= 400
    }
}
