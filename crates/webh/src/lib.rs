//! webh: a thin convenience layer over axum
//!
//! Configures a listener, attaches optional middleware, standardizes JSON
//! response envelopes and drains in-flight requests on SIGINT.
//!
//! Request path:
//! ```text
//! inbound request
//!     └── middleware stack (fixed order)
//!         ├── heartbeat   → short-circuits the health path
//!         ├── logger      → request id + start/end events
//!         ├── cors
//!         └── compress
//!             └── dispatch::wrap(handler)
//!                 ├── Ok(response)  → passed through
//!                 └── Err(error)    → error mapper → envelope
//! ```

pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;

#[cfg(test)]
mod testing;

// Re-export main types
pub use dispatch::{request_id, wrap, HandlerResult};
pub use envelope::{send, send_envelope, send_raw, try_send, try_send_raw, ResponseEnvelope};
pub use error::{EnvelopeError, HandlerError, HttpError, GENERIC_ERROR_MESSAGE};
pub use middleware::{
    CompressOptions, CorsOptions, LoggerOptions, MiddlewareOptions, MiddlewareStack,
};
pub use server::{HttpServer, HttpServerBuilder, ServerConfig, ServerState};

// Re-export axum for convenience - handlers are written against it
pub use axum;
pub use tower;
pub use tower_http;

/// Error types for building the HTTP server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server binding error: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Middleware configuration error: {0}")]
    MiddlewareError(String),

    #[error("Router configuration error: {0}")]
    RouterError(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Prelude for convenient imports by handler code
pub mod prelude {
    pub use super::axum::{
        extract::{Json, Path, Query, Request, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{delete, get, post, put},
        Router,
    };
    pub use super::dispatch::{request_id, wrap, HandlerResult};
    pub use super::envelope::{send, try_send, ResponseEnvelope};
    pub use super::error::{HandlerError, HttpError};
    pub use super::middleware::{CompressOptions, CorsOptions, LoggerOptions, MiddlewareOptions};
    pub use super::server::{HttpServer, HttpServerBuilder, ServerConfig, ServerState};
    pub use super::Result;
}
