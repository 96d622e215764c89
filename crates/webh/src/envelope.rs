//! Standard JSON response envelope
//!
//! Every JSON body this crate writes has the shape
//! `{"message": ..., "data"?: ..., "success": ..., "request_id"?: ...}`
//! where `success` is always derived from the status code.

use crate::error::EnvelopeError;
use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};

/// JSON body returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope<T = serde_json::Value> {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

impl<T> ResponseEnvelope<T> {
    pub fn new(status: StatusCode, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            message: message.into(),
            data,
            success: is_success(status),
            request_id: None,
        }
    }

    /// Attach a correlation id. Empty ids are dropped so they never reach the wire.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        self.request_id = (!request_id.is_empty()).then_some(request_id);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

fn is_success(status: StatusCode) -> bool {
    status.as_u16() < 400
}

/// Write an envelope, ignoring serialization failures.
///
/// On failure the status and content type are still sent, with an empty body.
pub fn send<T: Serialize>(status: StatusCode, message: impl Into<String>, data: Option<T>) -> Response {
    send_envelope(status, &ResponseEnvelope::new(status, message, data))
}

/// Write an envelope, returning the serialization failure to the caller.
pub fn try_send<T: Serialize>(
    status: StatusCode,
    message: impl Into<String>,
    data: Option<T>,
) -> Result<Response, EnvelopeError> {
    try_send_raw(status, &ResponseEnvelope::new(status, message, data))
}

/// Write an already built envelope (e.g. one carrying a request id).
pub fn send_envelope<T: Serialize>(status: StatusCode, envelope: &ResponseEnvelope<T>) -> Response {
    send_raw(status, envelope)
}

/// Write any serializable value as JSON, without the envelope.
pub fn send_raw<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response {
    match try_send_raw(status, value) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(status = status.as_u16(), error = %e, "dropping response body");
            json_response(status, Body::empty())
        }
    }
}

/// Write any serializable value as JSON, returning the serialization failure.
pub fn try_send_raw<T: Serialize + ?Sized>(
    status: StatusCode,
    value: &T,
) -> Result<Response, EnvelopeError> {
    let body = serde_json::to_vec(value)?;
    Ok(json_response(status, Body::from(body)))
}

fn json_response(status: StatusCode, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
