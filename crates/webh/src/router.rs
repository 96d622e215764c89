//! Static file serving

use crate::{Result, ServerError};
use axum::{
    extract::{OriginalUri, Request, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower::Layer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Serve `<cwd>/<path>` under `/<path>`.
pub fn file_server(router: Router, path: &str) -> Result<Router> {
    let relative = path.trim_matches('/');
    let cwd = std::env::current_dir()
        .map_err(|e| ServerError::RouterError(format!("cannot resolve working directory: {}", e)))?;
    serve_dir(router, &format!("/{}", relative), cwd.join(relative))
}

/// Serve the directory `root` under the URL prefix `mount`.
///
/// `/` installs the directory as the router fallback. Any other mount also
/// answers `GET <mount>` with a 301 to `<mount>/`.
pub fn serve_dir(router: Router, mount: &str, root: impl Into<PathBuf>) -> Result<Router> {
    if mount.contains(['{', '}', '*', ':']) {
        return Err(ServerError::RouterError(format!(
            "file server does not permit URL parameters: {}",
            mount
        )));
    }
    if !mount.starts_with('/') {
        return Err(ServerError::RouterError(format!(
            "file server path must start with '/': {}",
            mount
        )));
    }

    let root = root.into();
    log_root(mount, &root);

    let service = ServeDir::new(root);
    let mount = mount.trim_end_matches('/');
    if mount.is_empty() {
        return Ok(router.fallback_service(service));
    }

    let redirect = middleware::from_fn_with_state(Arc::<str>::from(mount), redirect_bare_mount);
    Ok(router.nest_service(mount, redirect.layer(service)))
}

async fn redirect_bare_mount(
    State(mount): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let bare = request
        .extensions()
        .get::<OriginalUri>()
        .is_some_and(|uri| uri.path() == &*mount);

    if bare && (request.method() == Method::GET || request.method() == Method::HEAD) {
        let location = format!("{}/", mount);
        return (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response();
    }
    next.run(request).await
}

fn log_root(mount: &str, root: &Path) {
    if root.is_dir() {
        info!("Serving static files from {:?} at {}", root, mount);
    } else {
        warn!("Static directory not found: {:?}", root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_files_under_mount() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1);").unwrap();

        let app = serve_dir(Router::new(), "/static", dir.path()).unwrap();

        let response = app.clone().oneshot(get("/static/app.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"console.log(1);");

        let response = app.oneshot(get("/static/missing.js")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bare_mount_redirects_to_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>docs</h1>").unwrap();

        let app = serve_dir(Router::new(), "/docs", dir.path()).unwrap();

        let response = app.clone().oneshot(get("/docs")).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("location").unwrap(), "/docs/");

        let response = app.oneshot(get("/docs/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_root_mount_is_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();

        let app = serve_dir(Router::new(), "/", dir.path()).unwrap();
        let response = app.oneshot(get("/index.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_rejects_url_parameters() {
        for mount in ["/files/{id}", "/files/*rest", "/files/:id", "files"] {
            let err = serve_dir(Router::new(), mount, "/tmp");
            assert!(matches!(err, Err(ServerError::RouterError(_))), "{}", mount);
        }
    }
}
