pub mod parameter;
pub mod request;
pub mod response;

pub use parameter::{
    DisplayableParameter, Parameter, ParameterType, REDACTED_VALUE, ResolvedType, resolve_type,
};
pub use request::{
    CACHE_MAX_SECS, DEFAULT_APP_SERVER, ProcedureCredentials, ProcedureRequest,
    RequestValidationError, TIMEOUT_MAX_MS,
};
pub use response::{ProcedureResponse, ProcedureResult};
