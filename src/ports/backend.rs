//! Port for the legacy application server's RPC capability.
//!
//! The vendor transport is consumed as an opaque capability: establish a
//! connection, open proxy interfaces on it, run procedures against a typed
//! [`ParameterSet`], release the returned request context and dispose
//! everything afterwards. Procedure invocation is blocking; callers run it on
//! a blocking worker and use [`ProxyInterface::cancel_all_requests`] to abort.
use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::models::ParameterType;

/// Errors raised by the backend transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// The app server has no free session; the payload is the encoded
    /// status line reported by the server, if any
    #[error("No available sessions: {0}")]
    NoAvailableSessions(String),

    /// The connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// The session broke while a request was running
    #[error("Session error: {0}")]
    Session(String),

    /// The procedure itself failed on the app server
    #[error("Procedure error: {0}")]
    Procedure(String),

    /// A parameter could not be bound or read back
    #[error("Invalid parameter at position {position}: {reason}")]
    InvalidParameter { position: u16, reason: String },
}

impl BackendError {
    /// Transport or session faults after which the connection must not be reused.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, BackendError::Connection(_) | BackendError::Session(_))
    }

    /// Raw message reported by the backend.
    pub fn message(&self) -> &str {
        match self {
            BackendError::NoAvailableSessions(message)
            | BackendError::Connection(message)
            | BackendError::Session(message)
            | BackendError::Procedure(message) => message,
            BackendError::InvalidParameter { reason, .. } => reason,
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A typed value bound to, or read from, a parameter slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
    MemPointer(Vec<u8>),
    Array(Vec<ParameterValue>),
    Object(Vec<(String, ParameterValue)>),
}

impl ParameterValue {
    /// Convert a JSON value, keeping integral numbers as integers.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ParameterValue::Null,
            Value::Bool(flag) => ParameterValue::Boolean(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => ParameterValue::Integer(integer),
                None => ParameterValue::Decimal(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => ParameterValue::Text(text.clone()),
            Value::Array(items) => {
                ParameterValue::Array(items.iter().map(ParameterValue::from_json).collect())
            }
            Value::Object(fields) => ParameterValue::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), ParameterValue::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Convert back to JSON; memory pointers become base64 text.
    pub fn into_json(self) -> Value {
        match self {
            ParameterValue::Null => Value::Null,
            ParameterValue::Boolean(flag) => Value::Bool(flag),
            ParameterValue::Integer(integer) => Value::Number(integer.into()),
            ParameterValue::Decimal(decimal) => {
                Number::from_f64(decimal).map_or(Value::Null, Value::Number)
            }
            ParameterValue::Text(text) => Value::String(text),
            ParameterValue::MemPointer(bytes) => Value::String(STANDARD.encode(bytes)),
            ParameterValue::Array(items) => {
                Value::Array(items.into_iter().map(ParameterValue::into_json).collect())
            }
            ParameterValue::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, value.into_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParameterValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterDirection {
    Input,
    Output,
}

/// One bound slot of a [`ParameterSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSlot {
    pub position: u16,
    pub direction: ParameterDirection,
    pub wire_type: ParameterType,
    pub value: ParameterValue,
    pub is_array: bool,
    /// Element count for array slots, 0 otherwise
    pub extent: usize,
}

/// Typed container binding each position to an input or output slot for
/// one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    slots: BTreeMap<u16, ParameterSlot>,
    return_value: Option<String>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a slot, replacing any previous binding at the same position.
    pub fn set_parameter(
        &mut self,
        position: u16,
        value: ParameterValue,
        direction: ParameterDirection,
        wire_type: ParameterType,
        is_array: bool,
        extent: usize,
    ) {
        self.slots.insert(
            position,
            ParameterSlot {
                position,
                direction,
                wire_type,
                value,
                is_array,
                extent,
            },
        );
    }

    pub fn slot(&self, position: u16) -> Option<&ParameterSlot> {
        self.slots.get(&position)
    }

    /// Slots in position order.
    pub fn slots(&self) -> impl Iterator<Item = &ParameterSlot> {
        self.slots.values()
    }

    /// Value of an output slot after the call; `None` when the position
    /// is unbound or not an output.
    pub fn output_parameter(&self, position: u16) -> Option<&ParameterValue> {
        self.slots
            .get(&position)
            .filter(|slot| slot.direction == ParameterDirection::Output)
            .map(|slot| &slot.value)
    }

    /// Write an output value, as the backend does when a call completes.
    pub fn set_output(&mut self, position: u16, value: ParameterValue) -> BackendResult<()> {
        match self.slots.get_mut(&position) {
            Some(slot) if slot.direction == ParameterDirection::Output => {
                slot.value = value;
                Ok(())
            }
            Some(_) => Err(BackendError::InvalidParameter {
                position,
                reason: "slot is bound as input".to_string(),
            }),
            None => Err(BackendError::InvalidParameter {
                position,
                reason: "slot is not bound".to_string(),
            }),
        }
    }

    /// Distinguished return-value string of the procedure, if it set one.
    pub fn procedure_return_value(&self) -> Option<&str> {
        self.return_value.as_deref()
    }

    pub fn set_procedure_return_value(&mut self, value: impl Into<String>) {
        self.return_value = Some(value.into());
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Effective settings used to open a physical connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub app_id: String,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

/// Establishes physical connections to an app server.
#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
    ) -> BackendResult<Arc<dyn BackendConnection>>;
}

/// A live connection shared by every request with the same credentials.
pub trait BackendConnection: Send + Sync {
    /// Open a proxy interface able to run procedures on this connection.
    fn open_proxy(&self) -> BackendResult<Arc<dyn ProxyInterface>>;

    /// Release the server-side session.
    fn release(&self);

    fn dispose(&self);
}

/// Session-bound handle invoking procedures. Must tolerate concurrent
/// invocations from several requests.
pub trait ProxyInterface: Send + Sync {
    /// Run `procedure`, filling output slots and the return value of
    /// `parameters`.
    fn run_procedure(
        &self,
        procedure: &str,
        parameters: &mut ParameterSet,
    ) -> BackendResult<Box<dyn RequestContext>>;

    /// Abort every request currently running on this interface.
    fn cancel_all_requests(&self);

    fn dispose(&self);
}

/// Server-side handle of a finished request; must be released even on success.
pub trait RequestContext: Send {
    fn release(self: Box<Self>);
}
