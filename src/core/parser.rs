//! Decoding of the backend's `statusCode::title[::description]` return
//! value convention and (de)serialization of response envelopes.
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::models::{ProcedureResponse, ProcedureResult};

const SEPARATOR: &str = "::";

static STATUS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9][0-9]{2}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcedureParser;

impl ProcedureParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a return value; `None` when it does not encode a status.
    ///
    /// The split is capped at three segments so a description may itself
    /// contain `::`.
    pub fn get_procedure_result(&self, return_value: &str) -> Option<ProcedureResult> {
        let mut segments = return_value.splitn(3, SEPARATOR);
        let status = segments.next()?;
        let title = segments.next()?;

        if !STATUS_PATTERN.is_match(status) {
            return None;
        }

        Some(ProcedureResult {
            status_code: status.parse().ok()?,
            title: title.to_string(),
            description: segments.next().map(str::to_string),
        })
    }

    /// Error envelope shaped like `response`, with status and diagnostics
    /// taken from `result`.
    pub fn get_error_response(
        &self,
        response: &ProcedureResponse,
        result: &ProcedureResult,
    ) -> ProcedureResponse {
        ProcedureResponse {
            procedure: response.procedure.clone(),
            status: result.status_code,
            last_modified: response.last_modified,
            origin_time: response.origin_time,
            result: response.result.clone(),
            title: Some(result.title.clone()),
            description: result.description.clone(),
        }
    }

    /// Error envelope for a call that produced no response, e.g. a refusal.
    /// The parsed result doubles as the payload.
    pub fn error_response_from_result(
        &self,
        procedure: &str,
        origin_time: u64,
        result: &ProcedureResult,
    ) -> ProcedureResponse {
        ProcedureResponse {
            procedure: procedure.to_string(),
            status: result.status_code,
            last_modified: None,
            origin_time,
            result: serde_json::to_value(result).unwrap_or(Value::Null),
            title: Some(result.title.clone()),
            description: result.description.clone(),
        }
    }

    pub fn get_procedure_response_bytes(
        &self,
        response: &ProcedureResponse,
    ) -> serde_json::Result<Bytes> {
        serde_json::to_vec(response).map(Bytes::from)
    }

    pub fn procedure_response_from_bytes(
        &self,
        bytes: &[u8],
    ) -> serde_json::Result<ProcedureResponse> {
        serde_json::from_slice(bytes)
    }
}
