//! Handler failures and their mapping to HTTP status + message.
//!
//! A handler failure is either *classified* (it carries the status and the
//! message the client should see) or *unclassified* (anything else). Only
//! classified failures reach the client verbatim; everything else collapses
//! to a generic 500 so internals never leak into a response body.

use axum::http::StatusCode;

/// Message returned to clients for every unclassified failure.
pub const GENERIC_ERROR_MESSAGE: &str = "errors during the request";

/// A failure carrying the status code and message to show the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HttpError {
    pub message: String,
    pub code: StatusCode,
}

impl HttpError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

/// Error returned by a wrapped handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Surfaced to the client as-is.
    #[error(transparent)]
    Classified(HttpError),

    /// Logged server-side, replaced by [`GENERIC_ERROR_MESSAGE`] for the client.
    #[error(transparent)]
    Unclassified(anyhow::Error),
}

impl HandlerError {
    /// Wrap any error. An [`HttpError`] inside it is still recognised.
    pub fn unclassified(error: impl Into<anyhow::Error>) -> Self {
        Self::from(error.into())
    }

    pub fn is_classified(&self) -> bool {
        matches!(self, Self::Classified(_))
    }

    /// Map this failure to the `(code, message)` pair the client will see.
    pub fn to_http_error(&self) -> HttpError {
        match self {
            Self::Classified(err) => err.clone(),
            Self::Unclassified(_) => {
                HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR_MESSAGE)
            }
        }
    }
}

impl From<HttpError> for HandlerError {
    fn from(err: HttpError) -> Self {
        Self::Classified(err)
    }
}

// An HttpError that travelled through anyhow is still classified.
impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<HttpError>() {
            Ok(http) => Self::Classified(http),
            Err(other) => Self::Unclassified(other),
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Unclassified(err.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unclassified(err.into())
    }
}

impl From<axum::Error> for HandlerError {
    fn from(err: axum::Error) -> Self {
        Self::Unclassified(err.into())
    }
}

impl From<EnvelopeError> for HandlerError {
    fn from(err: EnvelopeError) -> Self {
        Self::Unclassified(err.into())
    }
}

/// Failure to serialize a response body.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode response body: {0}")]
    Encode(#[from] serde_json::Error),
}
