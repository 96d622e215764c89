//! Demo route handlers

use serde::{Deserialize, Serialize};
use webh::axum;
use webh::prelude::*;

#[derive(Debug, Serialize)]
pub struct Greeting {
    pub greeting: String,
    pub request_id: String,
}

/// Message body accepted by `/echo`
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct EchoMessage {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

const MAX_ECHO_BYTES: usize = 64 * 1024;

pub fn router() -> Router {
    Router::new()
        .route("/hello", get(wrap(hello)))
        .route("/test", get(wrap(bad_input)))
        .route("/echo", post(wrap(echo)))
}

async fn hello(request: Request) -> HandlerResult {
    let greeting = Greeting {
        greeting: "hello".to_string(),
        request_id: request_id(&request),
    };
    Ok(send(StatusCode::OK, "ok", Some(greeting)))
}

async fn bad_input(_request: Request) -> HandlerResult {
    Err(HttpError::bad_request("bad input").into())
}

async fn echo(request: Request) -> HandlerResult {
    let body = axum::body::to_bytes(request.into_body(), MAX_ECHO_BYTES)
        .await
        .map_err(|_| HttpError::new(StatusCode::PAYLOAD_TOO_LARGE, "body too large"))?;

    let message: EchoMessage = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("invalid message: {}", e)))?;

    tracing::debug!(tags = message.tags.len(), "echoing message");
    Ok(try_send(StatusCode::OK, "echo", Some(message))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde_json::{json, Value};
    use webh::tower::ServiceExt;

    async fn call(request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (status, body) = call(post_json(r#"{"text":"hi","tags":["a"]}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"message": "echo", "data": {"text": "hi", "tags": ["a"]}, "success": true})
        );
    }

    #[tokio::test]
    async fn test_echo_rejects_malformed_json() {
        let (status, body) = call(post_json("{oops")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().starts_with("invalid message"));
    }

    #[tokio::test]
    async fn test_bad_input() {
        let request = axum::http::Request::builder()
            .uri("/test")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"message": "bad input", "success": false}));
    }
}
