pub mod http_handler;
pub mod memory_backend;
pub mod memory_cache;

/// Re-export commonly used types from adapters
pub use http_handler::{HttpHandler, router};
pub use memory_backend::{CallContext, InMemoryBackend, Invocation};
pub use memory_cache::InMemoryCache;
