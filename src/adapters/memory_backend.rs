//! In-process backend with scripted procedures.
//!
//! Procedures are plain closures over the [`ParameterSet`]. The adapter
//! counts connections, proxies and released request contexts so callers can
//! observe pooling behaviour, and can be told to fail upcoming connection or
//! proxy creation.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::ports::{
    BackendConnection, BackendConnector, BackendError, BackendResult, ConnectionSettings,
    ParameterSet, ProxyInterface, RequestContext,
};

/// Scripted procedure body.
pub type ProcedureHandler =
    Arc<dyn Fn(&mut ParameterSet, &CallContext) -> BackendResult<()> + Send + Sync>;

/// One recorded procedure invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub procedure: String,
    pub endpoint: String,
    pub username: String,
}

#[derive(Default)]
struct Counters {
    connections_created: AtomicUsize,
    connections_disposed: AtomicUsize,
    proxies_opened: AtomicUsize,
    proxies_disposed: AtomicUsize,
    contexts_released: AtomicUsize,
    cancellations: AtomicUsize,
}

#[derive(Default)]
struct BackendState {
    procedures: Mutex<HashMap<String, ProcedureHandler>>,
    connect_failures: Mutex<VecDeque<BackendError>>,
    open_failures: Mutex<VecDeque<BackendError>>,
    invocations: Mutex<Vec<Invocation>>,
    connect_delay: Mutex<Duration>,
    counters: Counters,
}

impl BackendState {
    fn pop_failure(queue: &Mutex<VecDeque<BackendError>>) -> Option<BackendError> {
        queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Cancellation flag shared by the requests of one proxy.
#[derive(Default)]
struct CancelSignal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelSignal {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a running procedure can see about its call.
pub struct CallContext {
    procedure: String,
    settings: ConnectionSettings,
    cancel: Arc<CancelSignal>,
}

impl CallContext {
    /// Procedure name as received by the backend, prefix included.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    pub fn username(&self) -> &str {
        &self.settings.username
    }

    pub fn app_id(&self) -> &str {
        &self.settings.app_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Block for `duration`, waking early with a session error when the
    /// proxy's requests are cancelled.
    pub fn sleep(&self, duration: Duration) -> BackendResult<()> {
        let deadline = Instant::now() + duration;
        let mut cancelled = self
            .cancel
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            if *cancelled {
                return Err(BackendError::Session("request cancelled".to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            cancelled = self
                .cancel
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Scripted backend. Cloning shares the scripts and counters.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<BackendState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `procedure` (the name the backend receives).
    pub fn register<F>(&self, procedure: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(&mut ParameterSet, &CallContext) -> BackendResult<()> + Send + Sync + 'static,
    {
        self.state
            .procedures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(procedure.into(), Arc::new(handler));
        self
    }

    /// Delay every new connection, widening the window for concurrent creators.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self
            .state
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn fail_next_connect(&self, error: BackendError) {
        self.state
            .connect_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    pub fn fail_next_open(&self, error: BackendError) {
        self.state
            .open_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state
            .invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connections_created(&self) -> usize {
        self.state.counters.connections_created.load(Ordering::SeqCst)
    }

    pub fn connections_disposed(&self) -> usize {
        self.state.counters.connections_disposed.load(Ordering::SeqCst)
    }

    pub fn proxies_opened(&self) -> usize {
        self.state.counters.proxies_opened.load(Ordering::SeqCst)
    }

    pub fn proxies_disposed(&self) -> usize {
        self.state.counters.proxies_disposed.load(Ordering::SeqCst)
    }

    pub fn contexts_released(&self) -> usize {
        self.state.counters.contexts_released.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.state.counters.cancellations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for InMemoryBackend {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> BackendResult<Arc<dyn BackendConnection>> {
        let delay = *self
            .state
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = BackendState::pop_failure(&self.state.connect_failures) {
            return Err(error);
        }

        self.state
            .counters
            .connections_created
            .fetch_add(1, Ordering::SeqCst);
        tracing::debug!(endpoint = %settings.endpoint, app_id = %settings.app_id, "In-memory connection opened");

        Ok(Arc::new(InMemoryConnection {
            state: Arc::clone(&self.state),
            settings: settings.clone(),
        }))
    }
}

struct InMemoryConnection {
    state: Arc<BackendState>,
    settings: ConnectionSettings,
}

impl BackendConnection for InMemoryConnection {
    fn open_proxy(&self) -> BackendResult<Arc<dyn ProxyInterface>> {
        if let Some(error) = BackendState::pop_failure(&self.state.open_failures) {
            return Err(error);
        }

        self.state
            .counters
            .proxies_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryProxy {
            state: Arc::clone(&self.state),
            settings: self.settings.clone(),
            cancel: Arc::new(CancelSignal::default()),
        }))
    }

    fn release(&self) {}

    fn dispose(&self) {
        self.state
            .counters
            .connections_disposed
            .fetch_add(1, Ordering::SeqCst);
    }
}

struct InMemoryProxy {
    state: Arc<BackendState>,
    settings: ConnectionSettings,
    cancel: Arc<CancelSignal>,
}

impl ProxyInterface for InMemoryProxy {
    fn run_procedure(
        &self,
        procedure: &str,
        parameters: &mut ParameterSet,
    ) -> BackendResult<Box<dyn RequestContext>> {
        self.state
            .invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                procedure: procedure.to_string(),
                endpoint: self.settings.endpoint.clone(),
                username: self.settings.username.clone(),
            });

        let handler = self
            .state
            .procedures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(procedure)
            .cloned()
            .ok_or_else(|| BackendError::Procedure(format!("procedure '{procedure}' not found")))?;

        let context = CallContext {
            procedure: procedure.to_string(),
            settings: self.settings.clone(),
            cancel: Arc::clone(&self.cancel),
        };
        handler(parameters, &context)?;

        Ok(Box::new(InMemoryRequestContext {
            state: Arc::clone(&self.state),
        }))
    }

    fn cancel_all_requests(&self) {
        self.state
            .counters
            .cancellations
            .fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn dispose(&self) {
        self.state
            .counters
            .proxies_disposed
            .fetch_add(1, Ordering::SeqCst);
    }
}

struct InMemoryRequestContext {
    state: Arc<BackendState>,
}

impl RequestContext for InMemoryRequestContext {
    fn release(self: Box<Self>) {
        self.state
            .counters
            .contexts_released
            .fetch_add(1, Ordering::SeqCst);
    }
}
