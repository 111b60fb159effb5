pub mod backend;
pub mod cache;

pub use backend::{
    BackendConnection, BackendConnector, BackendError, BackendResult, ConnectionSettings,
    ParameterDirection, ParameterSet, ParameterSlot, ParameterValue, ProxyInterface,
    RequestContext,
};
pub use cache::{CacheError, CacheResult, ResponseCache};
