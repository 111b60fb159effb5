use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    core::{ConnectionPool, ParameterService, ProcedureError, ProcedureExecutor, ProcedureParser},
    metrics::get_current_metrics,
    models::{ProcedureRequest, ProcedureResult},
    tracing_setup::create_request_span,
};

/// HTTP transport for procedure calls
pub struct HttpHandler {
    executor: Arc<dyn ProcedureExecutor>,
    parameters: ParameterService,
    parser: ProcedureParser,
    pool: Arc<ConnectionPool>,
}

impl HttpHandler {
    pub fn new(
        executor: Arc<dyn ProcedureExecutor>,
        parameters: ParameterService,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            executor,
            parameters,
            parser: ProcedureParser::new(),
            pool,
        }
    }

    /// Decode, validate and execute one procedure request. `procedure`
    /// comes from the URL and overrides the body's `proc`.
    pub async fn handle_procedure(&self, procedure: Option<String>, body: Bytes) -> Response {
        let mut request: ProcedureRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(error) => {
                tracing::debug!(error = %error, "Rejecting malformed procedure request");
                return error_body(StatusCode::BAD_REQUEST, "Bad request", &error.to_string());
            }
        };
        if let Some(procedure) = procedure {
            request.procedure = procedure;
        }

        if let Err(error) = request.validate() {
            tracing::debug!(procedure = %request.procedure, error = %error, "Rejecting invalid procedure request");
            return error_body(StatusCode::BAD_REQUEST, "Bad request", &error.to_string());
        }

        let filtered = self.parameters.get_filtered_parameters(&request.parameters);
        tracing::info!(
            procedure = %request.procedure,
            parameters = %serde_json::to_string(&filtered.displayable).unwrap_or_default(),
            has_redacted = filtered.has_redacted,
            cache = request.cache,
            timeout_ms = request.timeout,
            "Executing procedure"
        );

        // Fires when the client goes away and this future is dropped.
        let cancel = CancellationToken::new();
        let _disconnect = cancel.clone().drop_guard();

        match self
            .executor
            .execute_procedure(&request, filtered.parameter_hash.as_deref(), &cancel)
            .await
        {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response(),
            Err(error) => self.error_response(&request.procedure, &error),
        }
    }

    fn error_response(&self, procedure: &str, error: &ProcedureError) -> Response {
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match error {
            ProcedureError::Refused { .. } => {
                let result = error
                    .refusal_result()
                    .cloned()
                    .unwrap_or_else(|| ProcedureResult::new(503, "Service unavailable"));
                let envelope = self.parser.error_response_from_result(procedure, 0, &result);
                (status, Json(envelope)).into_response()
            }
            ProcedureError::Timeout { .. } => {
                error_body(status, "Request timeout", &error.to_string())
            }
            _ if status == StatusCode::BAD_REQUEST => {
                error_body(status, "Bad request", &error.to_string())
            }
            _ => error_body(status, "Internal server error", "Procedure execution failed"),
        }
    }

    /// Pool statistics; 503 once the pool has given up.
    pub fn handle_health_check(&self) -> Response {
        let stats = self.pool.stats();
        let fatal = self.pool.is_fatal();
        let status = if fatal {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };

        let health_data = serde_json::json!({
            "status": if fatal { "unhealthy" } else { "healthy" },
            "pool": stats,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        (status, Json(health_data)).into_response()
    }

    pub fn handle_metrics(&self) -> Response {
        let metrics_data = serde_json::json!({
            "metrics": get_current_metrics(),
            "pool": self.pool.stats(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        });

        (StatusCode::OK, Json(metrics_data)).into_response()
    }
}

fn error_body(status: StatusCode, title: &str, description: &str) -> Response {
    let body = serde_json::json!({
        "status": status.as_u16(),
        "title": title,
        "description": description,
    });
    (status, Json(body)).into_response()
}

async fn execute(State(handler): State<Arc<HttpHandler>>, body: Bytes) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = create_request_span("POST", "/api/openedge", &request_id);
    let response = handler.handle_procedure(None, body).instrument(span.clone()).await;
    span.record("http.status_code", response.status().as_u16());
    response
}

async fn execute_named(
    State(handler): State<Arc<HttpHandler>>,
    Path(procedure): Path<String>,
    body: Bytes,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = create_request_span("POST", &format!("/api/openedge/{procedure}"), &request_id);
    let response = handler
        .handle_procedure(Some(procedure), body)
        .instrument(span.clone())
        .await;
    span.record("http.status_code", response.status().as_u16());
    response
}

async fn health(State(handler): State<Arc<HttpHandler>>) -> Response {
    handler.handle_health_check()
}

async fn metrics(State(handler): State<Arc<HttpHandler>>) -> Response {
    handler.handle_metrics()
}

/// Routes: `POST /api/openedge`, `POST /api/openedge/{procedure}`,
/// `GET /health` and `GET /metrics`.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    Router::new()
        .route("/api/openedge", post(execute))
        .route("/api/openedge/{*procedure}", post(execute_named))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::{InMemoryBackend, InMemoryCache},
        config::{AppServerConfig, ServerConfig},
        core::{ChecksumService, build_executor},
    };

    fn create_test_handler(max_connections: usize) -> HttpHandler {
        let config = ServerConfig::builder()
            .max_connections(max_connections)
            .app_server("default", AppServerConfig::new("memory:5162"))
            .build()
            .unwrap();
        let backend = InMemoryBackend::new();
        backend.register("ping.p", |_, _| Ok(()));
        let pool = Arc::new(ConnectionPool::new(config.openedge.max_connections));
        let executor = build_executor(
            &config,
            Arc::new(backend),
            pool.clone(),
            Arc::new(InMemoryCache::new(16)),
        );

        HttpHandler::new(executor, ParameterService::new(ChecksumService::new()), pool)
    }

    #[tokio::test]
    async fn test_health_check_handler() {
        let handler = create_test_handler(4);
        let response = handler.handle_health_check();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let handler = create_test_handler(4);
        assert_eq!(handler.handle_metrics().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_and_invalid_requests() {
        let handler = create_test_handler(4);

        let response = handler
            .handle_procedure(None, Bytes::from_static(b"{not json"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handler
            .handle_procedure(Some("bad name!".to_string()), Bytes::from_static(b"{}"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_path_overrides_body_procedure() {
        let handler = create_test_handler(4);
        let response = handler
            .handle_procedure(
                Some("ping.p".to_string()),
                Bytes::from_static(br#"{"proc":"other.p"}"#),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refusal_maps_to_service_unavailable() {
        let handler = create_test_handler(0);
        let response = handler
            .handle_procedure(None, Bytes::from_static(br#"{"proc":"ping.p"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
