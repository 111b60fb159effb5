//! OpenEdge connector - a gateway that runs stored procedures on OpenEdge
//! application servers.
//!
//! Callers describe a call declaratively (procedure name, positional
//! parameters, optional credentials, cache and timeout hints) and get back a
//! JSON response envelope. The crate marshals the parameters onto the
//! backend's typed parameter set, pools one connection per credential
//! identity, runs the blocking invocation off the async runtime and decodes
//! the outputs. Backend-declared errors encoded in the procedure's return
//! value (`"404::Not found::detail"`) override an otherwise successful call.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use openedge_connector::{
//!     adapters::{InMemoryBackend, InMemoryCache},
//!     config::ServerConfig,
//!     core::{ConnectionPool, ProcedureExecutor, build_executor},
//!     models::ProcedureRequest,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config: ServerConfig = openedge_connector::config::load_config("config.toml").await?;
//! let pool = Arc::new(ConnectionPool::new(config.openedge.max_connections));
//! let executor = build_executor(
//!     &config,
//!     Arc::new(InMemoryBackend::new()),
//!     pool,
//!     Arc::new(InMemoryCache::new(config.cache.max_entries)),
//! );
//!
//! let request = ProcedureRequest::new("api/ping.p").with_cache(30);
//! let bytes = executor
//!     .execute_procedure(&request, None, &CancellationToken::new())
//!     .await?;
//! # let _ = bytes;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Business logic lives in `core`, traits at the backend and cache seams in
//! `ports`, and their implementations (plus the axum transport) in
//! `adapters`. The backend connector is pluggable: the bundled
//! [`adapters::InMemoryBackend`] runs scripted procedures in process.
//!
//! # Error Handling
//! Library operations return domain error enums built with `thiserror`;
//! configuration and binary plumbing use `eyre::Result` with `WrapErr`
//! context.
//!
//! # Concurrency & Data Structures
//! Shared maps (the connection pool, the in-memory cache) use
//! `scc::HashMap`. Connection creation is coalesced per credential hash.
pub mod config;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HttpHandler, InMemoryBackend, InMemoryCache},
    core::{ConnectionPool, ProcedureExecutor, build_executor},
    utils::{GracefulShutdown, ShutdownReason},
};
