//! Procedure orchestration.
//!
//! A call moves through parameter marshalling, proxy acquisition, the
//! blocking backend invocation and output extraction. Failures come back as
//! a [`ProcedureError`] whose `Timeout` and `Refused` variants are the two
//! outcomes transports are expected to render specially.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    core::{
        parameters::{ParameterError, ParameterService},
        parser::ProcedureParser,
        provider::{ProviderError, ProxyHandle, ProxyProvider},
    },
    metrics::{ProcedureTimer, increment_procedure_total, increment_refusal},
    models::{
        ProcedureCredentials, ProcedureRequest, ProcedureResponse, ProcedureResult, TIMEOUT_MAX_MS,
    },
    ports::{BackendError, ParameterSet, ProxyInterface},
    tracing_setup::create_procedure_span,
};

/// Status the backend uses for a hard denial; never retried.
const FORBIDDEN_STATUS: u16 = 403;

/// Errors surfaced by a procedure execution
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProcedureError {
    /// The call exceeded its timeout or the caller went away
    #[error("Procedure '{procedure}' timed out after {elapsed_ms}ms")]
    Timeout { procedure: String, elapsed_ms: u64 },

    /// The backend could not take the call right now
    #[error("Procedure '{procedure}' refused: {reason}")]
    Refused {
        procedure: String,
        reason: String,
        result: Option<ProcedureResult>,
    },

    #[error("Procedure '{procedure}' failed: {source}")]
    Backend {
        procedure: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("Failed to serialize procedure response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invocation task for '{procedure}' failed: {reason}")]
    Task { procedure: String, reason: String },

    #[error(transparent)]
    Provider(ProviderError),
}

impl ProcedureError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcedureError::Timeout { .. })
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, ProcedureError::Refused { .. })
    }

    /// Structured result carried by a refusal, if the backend encoded one.
    pub fn refusal_result(&self) -> Option<&ProcedureResult> {
        match self {
            ProcedureError::Refused { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    /// HTTP status a transport should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ProcedureError::Timeout { .. } => 408,
            ProcedureError::Refused { .. } => 503,
            ProcedureError::Provider(ProviderError::UnknownAppServer(_)) => 400,
            _ => 500,
        }
    }
}

/// Result type for procedure executions
pub type ExecutionResult<T> = Result<T, ProcedureError>;

/// Runs procedure requests. Implemented by the backend orchestrator and by
/// the caching decorator wrapping it.
#[async_trait]
pub trait ProcedureExecutor: Send + Sync {
    /// Execute `request` and return the response envelope.
    async fn get_procedure(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ProcedureResponse>;

    /// Execute `request` and return the serialized envelope.
    async fn execute_procedure(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<Bytes> {
        let response = self.get_procedure(request, parameter_hash, cancel).await?;
        Ok(serde_json::to_vec(&response).map(Bytes::from)?)
    }
}

/// Cancels the proxy's requests unless the invocation finished first.
struct InFlight {
    proxy: Arc<dyn ProxyInterface>,
    armed: bool,
}

impl InFlight {
    fn new(proxy: Arc<dyn ProxyInterface>) -> Self {
        Self { proxy, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Abandoning in-flight procedure, cancelling backend requests");
            self.proxy.cancel_all_requests();
        }
    }
}

/// Orchestrates procedure calls against the backend.
pub struct OpenEdgeExecutor {
    provider: ProxyProvider,
    parameters: ParameterService,
    parser: ProcedureParser,
    default_timeout: Option<Duration>,
}

impl OpenEdgeExecutor {
    pub fn new(
        provider: ProxyProvider,
        parameters: ParameterService,
        parser: ProcedureParser,
    ) -> Self {
        Self {
            provider,
            parameters,
            parser,
            default_timeout: None,
        }
    }

    /// Timeout applied to requests that leave `tw` at 0. Clamped like a
    /// request timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        let max = Duration::from_millis(TIMEOUT_MAX_MS);
        self.default_timeout = (!timeout.is_zero()).then(|| timeout.min(max));
        self
    }

    pub fn provider(&self) -> &ProxyProvider {
        &self.provider
    }

    fn effective_timeout(&self, request: &ProcedureRequest) -> Option<Duration> {
        match request.timeout {
            0 => self.default_timeout,
            _ => request.timeout_duration(),
        }
    }

    /// Run `request` racing its timeout and `cancel`.
    pub async fn execute_procedure_with_timeout(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ProcedureResponse> {
        let span = create_procedure_span(&request.procedure, parameter_hash);

        async move {
            let _timer = ProcedureTimer::new(&request.procedure);
            let started = Instant::now();
            let timed_out = || ProcedureError::Timeout {
                procedure: request.procedure.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            };

            let outcome = match self.effective_timeout(request) {
                Some(limit) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(timed_out()),
                        result = tokio::time::timeout(limit, self.get_procedure_response(request, cancel)) => {
                            result.unwrap_or_else(|_| Err(timed_out()))
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(timed_out()),
                        result = self.get_procedure_response(request, cancel) => result,
                    }
                }
            };

            match &outcome {
                Ok(response) => {
                    let span = tracing::Span::current();
                    span.record("status", response.status);
                    span.record("origin_time_ms", response.origin_time);
                    tracing::debug!(status = response.status, "Procedure completed");
                    increment_procedure_total(&request.procedure, response.status);
                }
                Err(error) if error.is_timeout() || error.is_refusal() => {
                    tracing::warn!(error = %error, "Procedure not completed");
                    increment_procedure_total(&request.procedure, error.status_code());
                }
                Err(error) => {
                    tracing::error!(error = %error, "Procedure failed");
                    increment_procedure_total(&request.procedure, error.status_code());
                }
            }

            outcome
        }
        .instrument(span)
        .await
    }

    fn cancelled(
        &self,
        request: &ProcedureRequest,
        started: Instant,
        cancel: &CancellationToken,
    ) -> ExecutionResult<()> {
        if cancel.is_cancelled() {
            return Err(ProcedureError::Timeout {
                procedure: request.procedure.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn get_procedure_response(
        &self,
        request: &ProcedureRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ProcedureResponse> {
        let parameter_set = self.parameters.generate_parameter_set(&request.parameters);
        let started = Instant::now();
        self.cancelled(request, started, cancel)?;

        let credentials = request
            .credentials
            .clone()
            .unwrap_or_else(ProcedureCredentials::anonymous);
        let handle = self.acquire_proxy(&request.procedure, &credentials).await?;

        let parameter_set = self.invoke(&handle, request, parameter_set, cancel).await?;
        self.cancelled(request, started, cancel)?;

        let outputs = self
            .parameters
            .get_output_parameters(&request.parameters, &parameter_set)?;
        let status = if outputs.values().all(|value| !value.is_null()) {
            200
        } else {
            204
        };
        let result = self.parameters.get_parsed_outputs(outputs);

        let response = ProcedureResponse::new(
            request.procedure.clone(),
            status,
            started.elapsed().as_millis() as u64,
            result,
        );

        let declared = parameter_set
            .procedure_return_value()
            .filter(|value| !value.trim().is_empty())
            .and_then(|value| self.parser.get_procedure_result(value));

        Ok(match declared {
            Some(declared) => {
                tracing::debug!(
                    status = declared.status_code,
                    title = %declared.title,
                    "Backend return value overrides response"
                );
                self.parser.get_error_response(&response, &declared)
            }
            None => response,
        })
    }

    /// Create a proxy, retrying once when the backend has no free session
    /// unless it reported a hard denial.
    async fn acquire_proxy(
        &self,
        procedure: &str,
        credentials: &ProcedureCredentials,
    ) -> ExecutionResult<ProxyHandle> {
        let message = match self.provider.create_proxy_instance(credentials).await {
            Ok(handle) => return Ok(handle),
            Err(ProviderError::Backend(BackendError::NoAvailableSessions(message))) => message,
            Err(error) => return Err(self.provider_failure(procedure, error)),
        };

        let result = self.parser.get_procedure_result(&message);
        let denied = result
            .as_ref()
            .is_some_and(|result| result.status_code == FORBIDDEN_STATUS);
        if denied {
            increment_refusal("no_sessions");
            return Err(ProcedureError::Refused {
                procedure: procedure.to_string(),
                reason: message,
                result,
            });
        }

        tracing::warn!(reason = %message, "No available sessions, retrying proxy creation once");
        match self.provider.create_proxy_instance(credentials).await {
            Ok(handle) => Ok(handle),
            Err(ProviderError::Backend(BackendError::NoAvailableSessions(message))) => {
                increment_refusal("no_sessions");
                Err(ProcedureError::Refused {
                    procedure: procedure.to_string(),
                    result: self.parser.get_procedure_result(&message),
                    reason: message,
                })
            }
            Err(error) => Err(self.provider_failure(procedure, error)),
        }
    }

    fn provider_failure(&self, procedure: &str, error: ProviderError) -> ProcedureError {
        match error {
            ProviderError::PoolExhausted(exhausted) => ProcedureError::Refused {
                procedure: procedure.to_string(),
                reason: exhausted.to_string(),
                result: None,
            },
            ProviderError::Backend(source) if source.is_connection_level() => {
                increment_refusal("connection_fault");
                ProcedureError::Refused {
                    procedure: procedure.to_string(),
                    result: Some(self.best_result(source.message(), None)),
                    reason: source.to_string(),
                }
            }
            ProviderError::Backend(source) => ProcedureError::Backend {
                procedure: procedure.to_string(),
                source,
            },
            other => ProcedureError::Provider(other),
        }
    }

    /// Parsed status from the error message or the return value, falling
    /// back to a generic 500.
    fn best_result(&self, message: &str, return_value: Option<&str>) -> ProcedureResult {
        self.parser
            .get_procedure_result(message)
            .or_else(|| return_value.and_then(|value| self.parser.get_procedure_result(value)))
            .unwrap_or_else(|| ProcedureResult::new(500, "Backend unavailable"))
    }

    /// Run the procedure on the blocking pool, cancelling the proxy's
    /// requests if this future is dropped or `cancel` fires first.
    async fn invoke(
        &self,
        handle: &ProxyHandle,
        request: &ProcedureRequest,
        mut parameter_set: ParameterSet,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ParameterSet> {
        let proxy = handle.proxy();
        let in_flight = InFlight::new(Arc::clone(&proxy));
        let started = Instant::now();

        let procedure = request.procedure.clone();
        let task = tokio::task::spawn_blocking(move || {
            let outcome = proxy
                .run_procedure(&procedure, &mut parameter_set)
                .map(|context| context.release());
            (parameter_set, outcome)
        });

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProcedureError::Timeout {
                    procedure: request.procedure.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            joined = task => joined,
        };
        in_flight.disarm();

        let (parameter_set, outcome) = joined.map_err(|error| {
            tracing::error!(error = %error, "Procedure invocation task faulted");
            ProcedureError::Task {
                procedure: request.procedure.clone(),
                reason: error.to_string(),
            }
        })?;

        match outcome {
            Ok(()) => Ok(parameter_set),
            Err(BackendError::NoAvailableSessions(message)) => {
                increment_refusal("no_sessions");
                Err(ProcedureError::Refused {
                    procedure: request.procedure.clone(),
                    result: self.parser.get_procedure_result(&message),
                    reason: message,
                })
            }
            Err(error) if error.is_connection_level() => {
                tracing::warn!(
                    credentials_hash = %handle.credentials_hash(),
                    error = %error,
                    "Connection-level fault, closing connection"
                );
                self.provider.close_proxy(handle).await;
                increment_refusal("connection_fault");
                Err(ProcedureError::Refused {
                    procedure: request.procedure.clone(),
                    result: Some(
                        self.best_result(error.message(), parameter_set.procedure_return_value()),
                    ),
                    reason: error.to_string(),
                })
            }
            Err(source) => Err(ProcedureError::Backend {
                procedure: request.procedure.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl ProcedureExecutor for OpenEdgeExecutor {
    async fn get_procedure(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<ProcedureResponse> {
        self.execute_procedure_with_timeout(request, parameter_hash, cancel)
            .await
    }

    async fn execute_procedure(
        &self,
        request: &ProcedureRequest,
        parameter_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionResult<Bytes> {
        let response = self
            .execute_procedure_with_timeout(request, parameter_hash, cancel)
            .await?;
        Ok(self.parser.get_procedure_response_bytes(&response)?)
    }
}

impl std::fmt::Debug for OpenEdgeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenEdgeExecutor")
            .field("provider", &self.provider)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{
        adapters::memory_backend::InMemoryBackend,
        config::AppServerConfig,
        core::{checksum::ChecksumService, pool::ConnectionPool},
        models::{Parameter, ParameterType},
        ports::ParameterValue,
    };

    fn executor(backend: &InMemoryBackend, max_connections: usize) -> OpenEdgeExecutor {
        let provider = ProxyProvider::new(
            Arc::new(backend.clone()),
            Arc::new(ConnectionPool::new(max_connections)),
            HashMap::from([(
                "default".to_string(),
                AppServerConfig::new("memory:5162").with_credentials("svc", "secret"),
            )]),
            ChecksumService::new(),
        );
        OpenEdgeExecutor::new(
            provider,
            ParameterService::new(ChecksumService::new()),
            ProcedureParser::new(),
        )
    }

    #[tokio::test]
    async fn test_outputs_and_status() {
        let backend = InMemoryBackend::new();
        backend
            .register("echo.p", |parameters, _| {
                let value = parameters
                    .slot(1)
                    .map(|slot| slot.value.clone())
                    .unwrap_or(ParameterValue::Null);
                parameters.set_output(2, value)
            })
            .register("half.p", |parameters, _| {
                parameters.set_output(1, ParameterValue::Text("set".into()))
            });
        let executor = executor(&backend, 4);
        let cancel = CancellationToken::new();

        let request = ProcedureRequest::new("echo.p")
            .with_parameter(Parameter::input(1, json!("hello")))
            .with_parameter(Parameter::output(2));
        let response = executor.get_procedure(&request, None, &cancel).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.result, json!("hello"));

        let request = ProcedureRequest::new("half.p")
            .with_parameter(Parameter::output(1).with_label("first"))
            .with_parameter(Parameter::output(2).with_label("second"));
        let response = executor.get_procedure(&request, None, &cancel).await.unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.result, json!({"first": "set", "second": null}));
        assert_eq!(backend.contexts_released(), 2);
    }

    #[tokio::test]
    async fn test_return_value_overrides_success() {
        let backend = InMemoryBackend::new();
        backend.register("missing.p", |parameters, _| {
            parameters.set_output(1, ParameterValue::Integer(1))?;
            parameters.set_procedure_return_value("404::Customer not found::id 7");
            Ok(())
        });
        let executor = executor(&backend, 4);

        let request = ProcedureRequest::new("missing.p")
            .with_parameter(Parameter::output(1).with_type(ParameterType::Integer));
        let response = executor
            .get_procedure(&request, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, 404);
        assert_eq!(response.title.as_deref(), Some("Customer not found"));
        assert_eq!(response.description.as_deref(), Some("id 7"));
        assert_eq!(response.result, json!(1));
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn test_procedure_errors_are_not_refusals() {
        let backend = InMemoryBackend::new();
        let executor = executor(&backend, 4);

        let error = executor
            .get_procedure(&ProcedureRequest::new("absent.p"), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, ProcedureError::Backend { .. }));
        assert_eq!(error.status_code(), 500);
        assert_eq!(backend.connections_disposed(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_a_refusal() {
        let backend = InMemoryBackend::new();
        let executor = executor(&backend, 0);

        let error = executor
            .get_procedure(&ProcedureRequest::new("any.p"), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(error.is_refusal());
        assert_eq!(error.refusal_result(), None);
        assert_eq!(error.status_code(), 503);
    }

    #[tokio::test]
    async fn test_unknown_app_server_is_a_client_error() {
        let backend = InMemoryBackend::new();
        let executor = executor(&backend, 4);
        let request = ProcedureRequest::new("any.p")
            .with_credentials(ProcedureCredentials::for_app_server("billing"));

        let error = executor
            .get_procedure(&request, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(error.status_code(), 400);
    }

    #[tokio::test]
    async fn test_already_cancelled_request_times_out() {
        let backend = InMemoryBackend::new();
        backend.register("noop.p", |_, _| Ok(()));
        let executor = executor(&backend, 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = executor
            .get_procedure(&ProcedureRequest::new("noop.p"), None, &cancel)
            .await
            .unwrap_err();

        assert!(error.is_timeout());
        assert!(backend.invocations().is_empty());
    }

    #[test]
    fn test_default_timeout_applies_only_to_unset_requests() {
        let backend = InMemoryBackend::new();
        let executor = executor(&backend, 1).with_default_timeout(Duration::from_secs(1));

        assert_eq!(
            executor.effective_timeout(&ProcedureRequest::new("a.p")),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            executor.effective_timeout(&ProcedureRequest::new("a.p").with_timeout(-1)),
            None
        );
        assert_eq!(
            executor.effective_timeout(&ProcedureRequest::new("a.p").with_timeout(250)),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            executor.effective_timeout(&ProcedureRequest::new("a.p").with_timeout(10_000_000)),
            Some(Duration::from_millis(TIMEOUT_MAX_MS))
        );
    }
}
