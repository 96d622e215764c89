//! HTTP server lifecycle
//!
//! `Created → Running → Draining → Stopped`, exactly once, in that order.
//!
//! [`HttpServer::start`] spawns the accept loop in the background and then
//! blocks on SIGINT. On the signal, new connections are refused, every open
//! connection is told to finish its in-flight request and close (keep-alive
//! off), and the whole drain is bounded by [`SHUTDOWN_TIMEOUT`]. Bind failures
//! and an exceeded drain deadline are logged, never returned.

use crate::middleware::{
    CompressOptions, CorsOptions, LoggerOptions, MiddlewareOptions, MiddlewareStack,
};
use crate::{Result, ServerError};
use axum::{body::Body, routing::MethodRouter, Router};
use futures::future::BoxFuture;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Sleep;
use tower::ServiceExt;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

/// Time allowed to receive a request's headers
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allowed, from the end of the request headers, to write the response.
/// The handler itself is never cancelled.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// Keep-alive connections with no request for this long are closed
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for in-flight requests once shutdown starts
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// HTTP port
    pub port: u16,
    /// Bind host
    pub bind_host: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_host: "0.0.0.0".to_string(),
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Socket address the server listens on
    pub fn addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.bind_host.parse().map_err(|_| {
            ServerError::BindError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid HTTP bind host: {}", self.bind_host),
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Lifecycle state of an [`HttpServer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Configured, not listening yet
    Created,
    /// Accept loop started
    Running,
    /// Shutdown signal received, in-flight requests finishing
    Draining,
    /// Drain finished or its deadline elapsed
    Stopped,
}

impl ServerState {
    /// The only state this one may move to.
    pub fn next(self) -> Option<ServerState> {
        match self {
            Self::Created => Some(Self::Running),
            Self::Running => Some(Self::Draining),
            Self::Draining => Some(Self::Stopped),
            Self::Stopped => None,
        }
    }
}

struct Lifecycle {
    state: watch::Sender<ServerState>,
}

impl Lifecycle {
    fn advance(&self, to: ServerState) {
        let from = *self.state.borrow();
        debug_assert_eq!(from.next(), Some(to), "invalid transition {:?} -> {:?}", from, to);
        self.state.send_replace(to);
        debug!(?from, ?to, "server state changed");
    }
}

/// HTTP server with optional middleware and graceful shutdown
pub struct HttpServer {
    config: ServerConfig,
    addr: SocketAddr,
    router: Router,
    middleware: MiddlewareStack,
    dispatch: Option<Dispatch>,
    state: watch::Sender<ServerState>,
}

impl HttpServer {
    /// Create a new server builder
    pub fn builder() -> HttpServerBuilder {
        HttpServerBuilder::new()
    }

    /// Server on `port` with the given middleware options
    pub fn new(port: u16, options: MiddlewareOptions) -> Result<Self> {
        HttpServerBuilder::new().port(port).middleware(options).build()
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Watch the lifecycle state
    pub fn lifecycle(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn route(mut self, path: &str, method_router: MethodRouter) -> Self {
        self.router = self.router.route(path, method_router);
        self
    }

    pub fn nest(mut self, prefix: &str, router: Router) -> Self {
        self.router = self.router.nest(prefix, router);
        self
    }

    pub fn merge(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Serve `<cwd>/<path>` as static files under `/<path>`
    pub fn file_server(mut self, path: &str) -> Result<Self> {
        self.router = crate::router::file_server(self.router, path)?;
        Ok(self)
    }

    /// Serve until SIGINT, then drain.
    ///
    /// Never fails: transport problems are logged and the call still returns
    /// once the drain finished or timed out.
    pub async fn start(self) {
        let dispatch = self.log_dispatch();
        let interrupt = tracing::dispatcher::with_default(&dispatch, interrupt_signal);
        self.run_until(interrupt).await
    }

    fn log_dispatch(&self) -> Dispatch {
        self.dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone))
    }

    pub(crate) async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let dispatch = self.log_dispatch();
        self.serve(shutdown).with_subscriber(dispatch).await
    }

    async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let HttpServer {
            config,
            addr,
            router,
            middleware,
            state,
            ..
        } = self;
        let lifecycle = Lifecycle { state };

        let app = middleware.apply(router);

        info!("server is running on port {}", config.port);

        let (drain_tx, drain_rx) = watch::channel(false);
        lifecycle.advance(ServerState::Running);
        let mut accept = tokio::spawn(
            accept_loop(addr, app, config.clone(), drain_rx).with_current_subscriber(),
        );

        shutdown.await;
        info!("server is shutting down");
        lifecycle.advance(ServerState::Draining);
        drain_tx.send_replace(true);

        match tokio::time::timeout(config.shutdown_timeout, &mut accept).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("accept loop failed: {}", e),
            Err(_) => {
                error!(
                    "could not gracefully shutdown the server: deadline of {:?} elapsed",
                    config.shutdown_timeout
                );
                // dropping the connection set aborts whatever is still running
                accept.abort();
            }
        }

        lifecycle.advance(ServerState::Stopped);
        info!("server stopped");
    }
}

#[cfg(unix)]
fn interrupt_signal() -> BoxFuture<'static, ()> {
    use tokio::signal::unix::{signal, SignalKind};

    // registered now, so a signal sent before the first poll is not lost
    match signal(SignalKind::interrupt()) {
        Ok(mut interrupt) => Box::pin(async move {
            interrupt.recv().await;
            info!("Received interrupt signal");
        }),
        Err(e) => {
            error!("Failed to install interrupt handler: {}", e);
            Box::pin(std::future::pending())
        }
    }
}

#[cfg(not(unix))]
fn interrupt_signal() -> BoxFuture<'static, ()> {
    Box::pin(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    })
}

async fn accept_loop(
    addr: SocketAddr,
    app: Router,
    config: ServerConfig,
    mut drain: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("closed server error: {}", e);
            return;
        }
    };
    info!("HTTP server listening on http://{}", addr);

    let conn_drain = drain.clone();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = drain.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(
                        serve_connection(stream, peer, app.clone(), config.clone(), conn_drain.clone())
                            .with_current_subscriber(),
                    );
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(finished);
            }
        }
    }

    drop(listener);
    debug!("draining {} connection(s)", connections.len());
    while let Some(finished) = connections.join_next().await {
        log_connection_exit(finished);
    }
}

fn log_connection_exit(finished: std::result::Result<(), JoinError>) {
    if let Err(e) = finished {
        if e.is_panic() {
            error!("connection task panicked: {}", e);
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    config: ServerConfig,
    mut drain: watch::Receiver<bool>,
) {
    let activity = Arc::new(Activity::new(config.write_timeout));
    let service = {
        let activity = activity.clone();
        service_fn(move |request: axum::http::Request<Incoming>| {
            let in_flight = activity.begin();
            let app = app.clone();
            async move {
                let response = app.oneshot(request.map(Body::new)).await;
                drop(in_flight);
                response
            }
        })
    };

    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(config.read_timeout)
        .keep_alive(true);
    let stream = DeadlineStream::new(stream, activity.clone());
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let idle = idle_timeout(activity, config.idle_timeout);
    tokio::pin!(idle);

    let mut closing = *drain.borrow_and_update();
    if closing {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection error from {}: {}", peer, e);
                }
                break;
            }
            _ = drain.changed(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = &mut idle, if !closing => {
                debug!("Closing idle connection from {}", peer);
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Request activity on one connection, for the idle and write timeouts.
struct Activity {
    epoch: Instant,
    write_timeout: Duration,
    in_flight: AtomicUsize,
    last_done_ms: AtomicU64,
    // 0 until the first request arrives
    write_deadline_ms: AtomicU64,
}

impl Activity {
    fn new(write_timeout: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            write_timeout,
            in_flight: AtomicUsize::new(0),
            last_done_ms: AtomicU64::new(0),
            write_deadline_ms: AtomicU64::new(0),
        }
    }

    fn begin(self: &Arc<Self>) -> InFlight {
        let deadline = (self.epoch.elapsed() + self.write_timeout).as_millis() as u64;
        self.write_deadline_ms.store(deadline.max(1), Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(self.clone())
    }

    /// Deadline for writing the current response, in ms since `epoch`.
    fn write_deadline(&self) -> Option<u64> {
        match self.write_deadline_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// How long the connection has had nothing to do, `None` while busy.
    fn idle_for(&self) -> Option<Duration> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let last = Duration::from_millis(self.last_done_ms.load(Ordering::SeqCst));
        Some(self.epoch.elapsed().saturating_sub(last))
    }
}

struct InFlight(Arc<Activity>);

impl Drop for InFlight {
    fn drop(&mut self) {
        let now = self.0.epoch.elapsed().as_millis() as u64;
        self.0.last_done_ms.store(now, Ordering::SeqCst);
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn idle_timeout(activity: Arc<Activity>, limit: Duration) {
    loop {
        let wait = match activity.idle_for() {
            None => limit,
            Some(idle) if idle >= limit => return,
            Some(idle) => limit - idle,
        };
        tokio::time::sleep(wait).await;
    }
}

/// Connection socket whose writes fail once the current response's write
/// deadline has passed. Reads are untouched.
struct DeadlineStream {
    inner: TcpStream,
    activity: Arc<Activity>,
    timer: Option<(u64, Pin<Box<Sleep>>)>,
}

impl DeadlineStream {
    fn new(inner: TcpStream, activity: Arc<Activity>) -> Self {
        Self {
            inner,
            activity,
            timer: None,
        }
    }

    /// Ready with an error once the deadline passed, otherwise arms a wakeup for it.
    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let Some(deadline_ms) = self.activity.write_deadline() else {
            return Poll::Pending;
        };

        let rearm = !matches!(self.timer, Some((armed, _)) if armed == deadline_ms);
        if rearm {
            let at = self.activity.epoch + Duration::from_millis(deadline_ms);
            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(at));
            self.timer = Some((deadline_ms, Box::pin(sleep)));
        }

        match self.timer.as_mut() {
            Some((_, sleep)) => match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "response write deadline elapsed",
                )),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

impl AsyncRead for DeadlineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DeadlineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_deadline(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.poll_deadline(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Builder for HttpServer
pub struct HttpServerBuilder {
    bind_host: String,
    port: u16,
    router: Option<Router>,
    middleware: MiddlewareOptions,
    dispatch: Option<Dispatch>,
}

impl HttpServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            router: None,
            middleware: MiddlewareOptions::default(),
            dispatch: None,
        }
    }

    /// Set HTTP port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set bind host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set the router
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Set middleware options
    pub fn middleware(mut self, options: MiddlewareOptions) -> Self {
        self.middleware = options;
        self
    }

    pub fn heartbeat(mut self, path: impl Into<String>) -> Self {
        self.middleware = self.middleware.heartbeat(path);
        self
    }

    pub fn logger(mut self, service_name: impl Into<String>, options: LoggerOptions) -> Self {
        self.middleware = self.middleware.logger(service_name, options);
        self
    }

    pub fn cors(mut self, options: CorsOptions) -> Self {
        self.middleware = self.middleware.cors(options);
        self
    }

    pub fn compress(mut self, options: CompressOptions) -> Self {
        self.middleware = self.middleware.compress(options);
        self
    }

    /// Send the server's log events to `dispatch` instead of the default subscriber
    pub fn dispatch(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Build the server
    pub fn build(self) -> Result<HttpServer> {
        let config = ServerConfig {
            port: self.port,
            bind_host: self.bind_host,
            ..ServerConfig::default()
        };
        let addr = config.addr()?;
        let middleware = self.middleware.build()?;
        let (state, _) = watch::channel(ServerState::Created);

        Ok(HttpServer {
            config,
            addr,
            router: self.router.unwrap_or_default(),
            middleware,
            dispatch: self.dispatch,
            state,
        })
    }
}

impl Default for HttpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
