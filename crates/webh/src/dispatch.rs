//! Fallible handler adapter
//!
//! axum handlers must always produce a response. [`wrap`] lets application
//! code return `Result<Response, HandlerError>` instead: successes pass
//! through untouched, failures are logged with the request's correlation id
//! and turned into a JSON error envelope.

use crate::envelope::{send_envelope, ResponseEnvelope};
use crate::error::HandlerError;
use axum::{extract::Request, response::Response};
use futures::future::BoxFuture;
use std::future::Future;
use tower_http::request_id::RequestId;

/// Result type of a handler passed to [`wrap`].
pub type HandlerResult = std::result::Result<Response, HandlerError>;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id of a request, or an empty string when none was assigned.
///
/// The id set by the logger middleware wins; otherwise an inbound
/// `x-request-id` header is used as-is.
pub fn request_id(request: &Request) -> String {
    if let Some(id) = request.extensions().get::<RequestId>() {
        if let Ok(id) = id.header_value().to_str() {
            return id.to_string();
        }
    }

    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default()
}

/// Adapt a fallible handler into an axum handler.
///
/// ```ignore
/// async fn create(request: Request) -> HandlerResult {
///     Err(HttpError::bad_request("bad input").into())
/// }
///
/// let router = Router::new().route("/items", post(wrap(create)));
/// ```
pub fn wrap<H, Fut>(
    handler: H,
) -> impl Fn(Request) -> BoxFuture<'static, Response> + Clone + Send + Sync + 'static
where
    H: Fn(Request) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    move |request: Request| -> BoxFuture<'static, Response> {
        let handler = handler.clone();
        Box::pin(async move {
            let request_id = request_id(&request);
            match handler(request).await {
                Ok(response) => response,
                Err(err) => error_response(&request_id, err),
            }
        })
    }
}

fn error_response(request_id: &str, err: HandlerError) -> Response {
    tracing::error!(
        request_id = %request_id,
        error = %err,
        classified = err.is_classified(),
        "cannot process request"
    );

    let mapped = err.to_http_error();
    let envelope = ResponseEnvelope::<()>::new(mapped.code, mapped.message, None)
        .with_request_id(request_id);
    send_envelope(mapped.code, &envelope)
}
