//! Optional middleware stack
//!
//! Options can be supplied in any order but are always layered the same way,
//! outermost first:
//!
//! ```text
//! heartbeat → logger → cors → compress → handler
//! ```
//!
//! Health checks therefore never pay for logging, CORS or compression, and
//! compression sits closest to the handler output.

use crate::{Result, ServerError};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::{predicate::Predicate, CompressionLayer},
    cors::{AllowHeaders, AllowOrigin, Any, CorsLayer, ExposeHeaders},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
    CompressionLevel, LatencyUnit,
};
use tracing::Level;

/// Methods every CORS configuration allows.
pub const CORS_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Headers allowed when a CORS configuration lists none.
const DEFAULT_CORS_HEADERS: [&str; 4] = ["origin", "accept", "content-type", "x-requested-with"];

/// Body returned by the heartbeat endpoint.
pub const HEARTBEAT_BODY: &str = ".";

/// Request logger settings
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    /// Level of the request start/end events (default: INFO)
    pub level: Level,
    /// Skip request headers on the request span (default: true)
    pub concise: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            concise: true,
        }
    }
}

/// Cross-origin rules. `"*"` in a list means any.
#[derive(Debug, Clone, Default)]
pub struct CorsOptions {
    pub allowed_origins: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds, 0 leaves the header out
    pub max_age: u64,
}

impl CorsOptions {
    fn build_layer(&self) -> Result<CorsLayer> {
        let creds = self.allow_credentials;

        let origins = if self.allowed_origins.is_empty() || has_wildcard(&self.allowed_origins) {
            if creds {
                AllowOrigin::mirror_request()
            } else {
                AllowOrigin::from(Any)
            }
        } else {
            AllowOrigin::list(parse_values(&self.allowed_origins)?)
        };

        let headers = if has_wildcard(&self.allowed_headers) {
            if creds {
                AllowHeaders::mirror_request()
            } else {
                AllowHeaders::from(Any)
            }
        } else if self.allowed_headers.is_empty() {
            AllowHeaders::list(DEFAULT_CORS_HEADERS.map(HeaderName::from_static))
        } else {
            AllowHeaders::list(parse_names(&self.allowed_headers)?)
        };

        let exposed = if has_wildcard(&self.exposed_headers) {
            if creds {
                return Err(ServerError::MiddlewareError(
                    "cannot expose all headers when credentials are allowed".to_string(),
                ));
            }
            ExposeHeaders::from(Any)
        } else {
            ExposeHeaders::list(parse_names(&self.exposed_headers)?)
        };

        let mut layer = CorsLayer::new()
            .allow_methods(CORS_METHODS.to_vec())
            .allow_origin(origins)
            .allow_headers(headers)
            .expose_headers(exposed)
            .allow_credentials(creds);

        if self.max_age > 0 {
            layer = layer.max_age(Duration::from_secs(self.max_age));
        }

        Ok(layer)
    }
}

fn has_wildcard(values: &[String]) -> bool {
    values.iter().any(|v| v.trim() == "*")
}

fn parse_values(values: &[String]) -> Result<Vec<HeaderValue>> {
    values
        .iter()
        .map(|v| {
            HeaderValue::from_str(v.trim())
                .map_err(|e| ServerError::MiddlewareError(format!("invalid CORS origin {:?}: {}", v, e)))
        })
        .collect()
}

fn parse_names(values: &[String]) -> Result<Vec<HeaderName>> {
    values
        .iter()
        .map(|v| {
            HeaderName::from_bytes(v.trim().as_bytes())
                .map_err(|e| ServerError::MiddlewareError(format!("invalid CORS header {:?}: {}", v, e)))
        })
        .collect()
}

/// Response compression settings
#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// Encoder level, negative values select the encoder default
    pub level: i32,
    /// Media types to compress, either exact (`application/json`) or `type/*`
    pub content_types: Vec<String>,
}

impl CompressOptions {
    pub fn new(level: i32, content_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            level,
            content_types: content_types.into_iter().map(Into::into).collect(),
        }
    }

    fn build_layer(&self) -> Result<CompressionLayer<ContentTypePredicate>> {
        if self.content_types.is_empty() {
            return Err(ServerError::MiddlewareError(
                "compression needs at least one content type".to_string(),
            ));
        }

        let quality = if self.level < 0 {
            CompressionLevel::Default
        } else {
            CompressionLevel::Precise(self.level)
        };

        let predicate = ContentTypePredicate {
            types: self
                .content_types
                .iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect(),
        };

        Ok(CompressionLayer::new()
            .quality(quality)
            .compress_when(predicate))
    }
}

/// Compress only responses whose content type is in the configured set.
#[derive(Debug, Clone)]
pub struct ContentTypePredicate {
    types: Arc<[String]>,
}

impl ContentTypePredicate {
    fn matches(&self, content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        self.types.iter().any(|allowed| match allowed.strip_suffix("/*") {
            Some(prefix) => media_type
                .split_once('/')
                .is_some_and(|(kind, _)| kind == prefix || prefix == "*"),
            None => *allowed == media_type,
        })
    }
}

impl Predicate for ContentTypePredicate {
    fn should_compress<B>(&self, response: &axum::http::Response<B>) -> bool
    where
        B: http_body::Body,
    {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| self.matches(ct))
    }
}

/// Middleware configuration accumulated by the server builder.
///
/// Setting an option twice keeps the last value.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareOptions {
    heartbeat: Option<String>,
    logger: Option<(String, LoggerOptions)>,
    cors: Option<CorsOptions>,
    compress: Option<CompressOptions>,
}

impl MiddlewareOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer GET/HEAD on `path` with a fixed 200 before anything else runs
    pub fn heartbeat(mut self, path: impl Into<String>) -> Self {
        self.heartbeat = Some(path.into());
        self
    }

    /// Log request start/end tagged with a request id
    pub fn logger(mut self, service_name: impl Into<String>, options: LoggerOptions) -> Self {
        self.logger = Some((service_name.into(), options));
        self
    }

    pub fn cors(mut self, options: CorsOptions) -> Self {
        self.cors = Some(options);
        self
    }

    pub fn compress(mut self, options: CompressOptions) -> Self {
        self.compress = Some(options);
        self
    }

    /// Validate the options and build the layers.
    pub fn build(self) -> Result<MiddlewareStack> {
        let heartbeat = match self.heartbeat {
            Some(path) if !path.starts_with('/') => {
                return Err(ServerError::MiddlewareError(format!(
                    "heartbeat path must start with '/': {:?}",
                    path
                )));
            }
            Some(path) => Some(Arc::from(path)),
            None => None,
        };

        let cors = self.cors.as_ref().map(CorsOptions::build_layer).transpose()?;
        let compress = self
            .compress
            .as_ref()
            .map(CompressOptions::build_layer)
            .transpose()?;

        Ok(MiddlewareStack {
            heartbeat,
            logger: self
                .logger
                .map(|(service, options)| (Arc::from(service), options)),
            cors,
            compress,
        })
    }
}

/// Validated middleware, ready to wrap a router.
#[derive(Clone)]
pub struct MiddlewareStack {
    heartbeat: Option<Arc<str>>,
    logger: Option<(Arc<str>, LoggerOptions)>,
    cors: Option<CorsLayer>,
    compress: Option<CompressionLayer<ContentTypePredicate>>,
}

impl MiddlewareStack {
    /// Stack with nothing enabled.
    pub fn empty() -> Self {
        Self {
            heartbeat: None,
            logger: None,
            cors: None,
            compress: None,
        }
    }

    /// Apply the stack to a router. Routes must already be registered.
    pub fn apply(&self, router: Router) -> Router {
        let mut router = router;

        // Compression (innermost - sees the handler's content type)
        if let Some(ref compress) = self.compress {
            router = router.layer(compress.clone());
        }

        if let Some(ref cors) = self.cors {
            router = router.layer(cors.clone());
        }

        if let Some((ref service, ref options)) = self.logger {
            let service = service.clone();
            let concise = options.concise;

            let trace = TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<Body>| {
                    let request_id = request
                        .extensions()
                        .get::<RequestId>()
                        .and_then(|id| id.header_value().to_str().ok())
                        .unwrap_or_default();

                    let span = tracing::info_span!(
                        "request",
                        service = %service,
                        request_id = %request_id,
                        method = %request.method(),
                        uri = %request.uri(),
                        headers = tracing::field::Empty,
                    );
                    if !concise {
                        span.record("headers", tracing::field::debug(request.headers()));
                    }
                    span
                })
                .on_request(DefaultOnRequest::new().level(options.level))
                .on_response(
                    DefaultOnResponse::new()
                        .level(options.level)
                        .latency_unit(LatencyUnit::Millis),
                );

            router = router.layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(trace)
                    .layer(PropagateRequestIdLayer::x_request_id()),
            );
        }

        // Heartbeat (outermost - runs first on request)
        if let Some(ref path) = self.heartbeat {
            router = router.layer(middleware::from_fn_with_state(path.clone(), heartbeat));
        }

        router
    }
}

impl Default for MiddlewareStack {
    fn default() -> Self {
        Self::empty()
    }
}

/// Heartbeat middleware
async fn heartbeat(State(path): State<Arc<str>>, request: Request, next: Next) -> Response {
    let method = request.method();
    if (method == Method::GET || method == Method::HEAD)
        && request.uri().path().eq_ignore_ascii_case(&path)
    {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            HEARTBEAT_BODY,
        )
            .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{wrap, HandlerResult};
    use crate::error::HttpError;
    use crate::testing::capture_logs;
    use axum::routing::get;
    use tower::ServiceExt;
    use tracing::instrument::WithSubscriber;

    const LONG_TEXT: &str = "the quick brown fox jumps over the lazy dog. ";

    async fn text() -> String {
        // text/plain; charset=utf-8
        LONG_TEXT.repeat(64)
    }

    async fn untyped() -> Response {
        Response::new(Body::from(LONG_TEXT.repeat(64)))
    }

    fn app(options: MiddlewareOptions) -> Router {
        let router = Router::new()
            .route("/hello", get(text))
            .route("/untyped", get(untyped));
        options.build().unwrap().apply(router)
    }

    fn request(method: Method, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn everything() -> MiddlewareOptions {
        // deliberately supplied in reverse of the layering order
        MiddlewareOptions::new()
            .compress(CompressOptions::new(5, ["text/*"]))
            .cors(CorsOptions {
                allowed_origins: vec!["https://app.example.com".to_string()],
                max_age: 600,
                ..Default::default()
            })
            .logger("test-service", LoggerOptions::default())
            .heartbeat("/ping")
    }

    #[tokio::test]
    async fn test_heartbeat_bypasses_other_middleware() {
        let app = app(everything());

        for _ in 0..3 {
            let mut req = request(Method::GET, "/ping");
            req.headers_mut()
                .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
            req.headers_mut()
                .insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com"));

            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("x-request-id").is_none());
            assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
            assert!(response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none());
            assert_eq!(body_string(response).await, HEARTBEAT_BODY);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_only_answers_get_and_head() {
        let app = app(MiddlewareOptions::new().heartbeat("/ping"));

        let response = app.clone().oneshot(request(Method::HEAD, "/PING")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(request(Method::POST, "/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logger_assigns_and_echoes_request_id() {
        let app = app(MiddlewareOptions::new().logger("svc", LoggerOptions::default()));

        let response = app.clone().oneshot(request(Method::GET, "/hello")).await.unwrap();
        let id = response.headers().get("x-request-id").unwrap();
        assert!(!id.is_empty());

        let mut req = request(Method::GET, "/hello");
        req.headers_mut()
            .insert("x-request-id", HeaderValue::from_static("client-id"));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "client-id");
    }

    #[tokio::test]
    async fn test_logger_tags_start_and_end_events() {
        let (dispatch, logs) = capture_logs();
        let app = app(MiddlewareOptions::new().logger("svc", LoggerOptions::default()));

        let response = app
            .oneshot(request(Method::GET, "/hello"))
            .with_subscriber(dispatch)
            .await
            .unwrap();
        let id = response.headers().get("x-request-id").unwrap().to_str().unwrap();

        let lines = logs.lines();
        for message in ["started processing request", "finished processing request"] {
            let line = lines
                .iter()
                .find(|l| l.contains(message))
                .unwrap_or_else(|| panic!("no {:?} event in {:?}", message, lines));
            assert!(line.contains("service=svc"), "{}", line);
            assert!(line.contains(&format!("request_id={}", id)), "{}", line);
        }
    }

    #[tokio::test]
    async fn test_failure_log_and_envelope_share_request_id() {
        async fn bad_input(_request: Request) -> HandlerResult {
            Err(HttpError::bad_request("bad input").into())
        }

        let (dispatch, logs) = capture_logs();
        let router = Router::new().route("/test", get(wrap(bad_input)));
        let app = MiddlewareOptions::new()
            .logger("svc", LoggerOptions::default())
            .build()
            .unwrap()
            .apply(router);

        let response = app
            .oneshot(request(Method::GET, "/test"))
            .with_subscriber(dispatch)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let header_id = response.headers().get("x-request-id").unwrap().to_str().unwrap().to_string();

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["request_id"], header_id.as_str());

        let lines = logs.lines();
        let line = lines
            .iter()
            .find(|l| l.contains("cannot process request"))
            .unwrap_or_else(|| panic!("failure not logged: {:?}", lines));
        assert!(line.contains("ERROR"), "{}", line);
        assert!(line.contains(&format!("request_id={}", header_id)), "{}", line);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let app = app(everything());

        let mut req = request(Method::OPTIONS, "/hello");
        req.headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_static("https://app.example.com"));
        req.headers_mut().insert(
            header::ACCESS_CONTROL_REQUEST_METHOD,
            HeaderValue::from_static("DELETE"),
        );

        let response = app.oneshot(req).await.unwrap();
        let headers = response.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
        let methods = headers
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .unwrap()
            .to_str()
            .unwrap();
        for method in CORS_METHODS {
            assert!(methods.contains(method.as_str()), "{} missing", method);
        }
        assert_eq!(headers.get(header::ACCESS_CONTROL_MAX_AGE).unwrap(), "600");
    }

    #[tokio::test]
    async fn test_cors_ignores_unknown_origin() {
        let app = app(everything());

        let mut req = request(Method::GET, "/hello");
        req.headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_static("https://evil.example.com"));

        let response = app.oneshot(req).await.unwrap();
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_compress_requires_matching_content_type() {
        let app = app(everything());

        let mut req = request(Method::GET, "/hello");
        req.headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.headers().get(header::CONTENT_ENCODING).unwrap(), "gzip");

        let mut req = request(Method::GET, "/untyped");
        req.headers_mut()
            .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let response = app.oneshot(req).await.unwrap();
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(body_string(response).await, LONG_TEXT.repeat(64));
    }

    #[test]
    fn test_content_type_matching() {
        let predicate = ContentTypePredicate {
            types: Arc::from(vec!["application/json".to_string(), "text/*".to_string()]),
        };

        assert!(predicate.matches("application/json"));
        assert!(predicate.matches("Application/JSON; charset=utf-8"));
        assert!(predicate.matches("text/html"));
        assert!(!predicate.matches("image/png"));
        assert!(!predicate.matches("application/jsonp"));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let err = MiddlewareOptions::new().heartbeat("ping").build();
        assert!(matches!(err, Err(ServerError::MiddlewareError(_))));

        let err = MiddlewareOptions::new()
            .cors(CorsOptions {
                exposed_headers: vec!["*".to_string()],
                allow_credentials: true,
                ..Default::default()
            })
            .build();
        assert!(matches!(err, Err(ServerError::MiddlewareError(_))));

        let err = MiddlewareOptions::new()
            .cors(CorsOptions {
                allowed_headers: vec!["bad header".to_string()],
                ..Default::default()
            })
            .build();
        assert!(matches!(err, Err(ServerError::MiddlewareError(_))));

        let err = MiddlewareOptions::new()
            .compress(CompressOptions::new(1, Vec::<String>::new()))
            .build();
        assert!(matches!(err, Err(ServerError::MiddlewareError(_))));
    }

    #[test]
    fn test_wildcard_with_credentials_mirrors() {
        let stack = MiddlewareOptions::new()
            .cors(CorsOptions {
                allowed_origins: vec!["*".to_string()],
                allowed_headers: vec!["*".to_string()],
                allow_credentials: true,
                ..Default::default()
            })
            .build()
            .unwrap();
        // tower-http validates the rules when the layer is applied
        let _ = stack.apply(Router::new().route("/hello", get(text)));
    }
}
