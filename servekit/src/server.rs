//! The server lifecycle: route registration, listener startup, and
//! signal-driven graceful shutdown with a bounded drain.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::handler::Handler;
use axum::routing::{any, MethodRouter};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::health;
use crate::metrics::{self, MetricsRegistry};
use crate::recovery;
use crate::shutdown;

/// Bounded wait for in-flight requests at shutdown, unless overridden with
/// [`Server::set_graceful_shutdown_duration`].
pub const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(2);

/// Fatal server failures, surfaced by [`Server::try_serve`].
///
/// [`Server::serve`] treats every variant as grounds to terminate the
/// process. Nothing here is retried.
#[derive(Error, Debug)]
pub enum ServeError {
    /// A listener could not be bound.
    #[error("failed to bind {role} listener on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },

    /// The primary listener failed while accepting connections.
    /// Connection-scoped accept errors (aborted, reset) are skipped and never
    /// produce this.
    #[error("failed to accept connection on {addr}: {source}")]
    Accept { addr: SocketAddr, source: io::Error },

    /// The metrics listener stopped serving.
    #[error("metrics listener on {addr} failed: {source}")]
    Metrics { addr: SocketAddr, source: io::Error },
}

/// HTTP server facade: route registration with per-route latency metrics,
/// health endpoints, panic recovery, a separate metrics-only listener, and
/// signal-driven graceful shutdown behind one type.
///
/// Construct, register routes, then serve exactly once; serving consumes the
/// server, so reconfiguration or restart after start is a compile error
/// rather than a runtime surprise. The underlying router panics on duplicate
/// registration of the same path and method, which includes re-registering
/// one of [`health::DEFAULT_HEALTH_PATHS`].
pub struct Server {
    listen: SocketAddr,
    metrics_listen: SocketAddr,
    graceful_shutdown: Duration,
    shutdown: Option<CancellationToken>,
    metrics: MetricsRegistry,
    router: Router,
    health_paths: Vec<String>,
}

impl Server {
    /// Build an unstarted server for the given bind addresses, with a 2s
    /// grace period, SIGINT/SIGTERM as the shutdown trigger, and a fresh
    /// metrics registry. Does not bind or spawn anything.
    pub fn new(listen: SocketAddr, metrics_listen: SocketAddr) -> Self {
        Self {
            listen,
            metrics_listen,
            graceful_shutdown: DEFAULT_GRACEFUL_SHUTDOWN,
            shutdown: None,
            metrics: MetricsRegistry::new(),
            router: Router::new(),
            health_paths: Vec::new(),
        }
    }

    /// Like [`Server::new`], but shutdown fires when `shutdown` is cancelled
    /// instead of on OS signals. For tests and embedders with their own
    /// signal handling.
    pub fn with_shutdown(
        shutdown: CancellationToken,
        listen: SocketAddr,
        metrics_listen: SocketAddr,
    ) -> Self {
        let mut server = Self::new(listen, metrics_listen);
        server.shutdown = Some(shutdown);
        server
    }

    /// Override the drain deadline applied when shutdown fires.
    pub fn set_graceful_shutdown_duration(&mut self, duration: Duration) {
        self.graceful_shutdown = duration;
    }

    /// The effective drain deadline.
    pub fn graceful_shutdown_duration(&self) -> Duration {
        self.graceful_shutdown
    }

    /// Replace the metrics registry the latency middleware and scrape
    /// endpoint use. Useful to share one registry across servers or to
    /// pre-install it globally.
    pub fn set_metrics_registry(&mut self, registry: MetricsRegistry) {
        self.metrics = registry;
    }

    /// The registry requests are recorded into.
    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Register a handler at an exact path, wrapped by the latency recorder.
    ///
    /// `method_router` carries the method filtering (`get`, `post`, `any`,
    /// ...), so router semantics pass straight through.
    pub fn handle(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.router = std::mem::take(&mut self.router).route(path, method_router);
        self
    }

    /// Register a handler for a prefix and everything beneath it, wrapped by
    /// the latency recorder.
    ///
    /// Requests under the prefix are recorded under the `{prefix}/*rest`
    /// route template.
    pub fn handle_prefix(&mut self, prefix: &str, method_router: MethodRouter) -> &mut Self {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            self.handle("/", method_router.clone());
            return self.handle("/*rest", method_router);
        }

        self.handle(prefix, method_router.clone());
        self.handle(&format!("{prefix}/"), method_router.clone());
        self.handle(&format!("{prefix}/*rest"), method_router)
    }

    /// Register a bare handler function at an exact path, for every method.
    pub fn handle_fn<H, T>(&mut self, path: &str, handler: H) -> &mut Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle(path, any(handler))
    }

    /// Register a bare handler function for a prefix, for every method.
    pub fn handle_prefix_fn<H, T>(&mut self, prefix: &str, handler: H) -> &mut Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.handle_prefix(prefix, any(handler))
    }

    /// Serve the health responder at an extra path, alongside the default
    /// [`health::DEFAULT_HEALTH_PATHS`]. Health paths are not timed.
    pub fn add_health_handler(&mut self, path: &str) {
        self.health_paths.push(path.to_string());
    }

    /// Start both listeners and block until shutdown completes.
    ///
    /// Bind, accept, and metrics-listener failures are fatal: they are
    /// logged and the process exits with status 1. This is the deliberate
    /// fail-fast policy for servers run under a process supervisor; use
    /// [`Server::try_serve`] to handle those failures yourself.
    ///
    /// Shutdown begins when the cancellation source fires (SIGINT/SIGTERM by
    /// default). In-flight requests get up to the configured grace period to
    /// finish; connections still open at the deadline are forcibly closed.
    /// The metrics listener is never drained.
    pub async fn serve(self) {
        if let Err(error) = self.try_serve().await {
            tracing::error!("server failed: {}", error);
            std::process::exit(1);
        }
    }

    /// Like [`Server::serve`], but fatal failures are returned instead of
    /// terminating the process.
    pub async fn try_serve(self) -> Result<(), ServeError> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|source| ServeError::Bind {
                role: "http",
                addr: self.listen,
                source,
            })?;

        let metrics_listener = TcpListener::bind(self.metrics_listen)
            .await
            .map_err(|source| ServeError::Bind {
                role: "metrics",
                addr: self.metrics_listen,
                source,
            })?;

        self.try_serve_on(listener, metrics_listener).await
    }

    /// Serve on pre-bound listeners, ignoring the configured bind addresses.
    /// Escape hatch for tests (ephemeral ports) and socket activation.
    pub async fn try_serve_on(
        mut self,
        listener: TcpListener,
        metrics_listener: TcpListener,
    ) -> Result<(), ServeError> {
        let shutdown = self.shutdown.take().unwrap_or_else(|| {
            let token = CancellationToken::new();
            shutdown::cancel_on_signal(token.clone());
            token
        });

        let grace = self.graceful_shutdown;
        let registry = self.metrics.clone();
        let app = self.into_router();

        let addr = listener.local_addr().unwrap();
        let metrics_addr = metrics_listener.local_addr().unwrap();
        tracing::info!("listening on {}, metrics on {}", addr, metrics_addr);

        let metrics_app = metrics::metrics_router(&registry);
        let mut metrics_task =
            tokio::spawn(async move { axum::serve(metrics_listener, metrics_app).await });

        // Hyper server with manual connection handling, so the drain phase
        // can both wait for connections and force-close them at the deadline.
        let builder = AutoBuilder::new(TokioExecutor::new());
        let graceful = GracefulShutdown::new();
        let mut conns = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (socket, remote_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) if is_connection_error(&e) => {
                            tracing::debug!("connection aborted before accept: {}", e);
                            continue;
                        }
                        Err(e) => {
                            metrics_task.abort();
                            return Err(ServeError::Accept { addr, source: e });
                        }
                    };

                    // Match axum default: set TCP_NODELAY for low-latency
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::warn!("failed to set TCP_NODELAY: {}", e);
                    }

                    // Per-connection service that stamps the peer address into ConnectInfo
                    let app = app.clone();
                    let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let mut app = app.clone();
                        let mut req = req.map(axum::body::Body::new);
                        req.extensions_mut().insert(ConnectInfo(remote_addr));
                        async move { app.call(req).await }
                    });

                    // HTTP/1 + HTTP/2 auto-detection, with upgrade support
                    let conn = builder.serve_connection_with_upgrades(
                        TokioIo::new(socket),
                        service,
                    );

                    // Register with the graceful watcher so drain waits for it,
                    // and keep the task so deadline expiry can abort it.
                    let conn = graceful.watch(conn.into_owned());

                    conns.spawn(async move {
                        if let Err(e) = conn.await {
                            tracing::debug!("connection closed: {}", e);
                        }
                    });
                }
                // Reap finished connection tasks so the set only holds live ones.
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                result = &mut metrics_task => {
                    let source = match result {
                        Ok(Ok(())) => io::Error::new(
                            io::ErrorKind::Other,
                            "metrics server exited unexpectedly",
                        ),
                        Ok(Err(e)) => e,
                        Err(join_error) => io::Error::new(io::ErrorKind::Other, join_error),
                    };
                    return Err(ServeError::Metrics { addr: metrics_addr, source });
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        drop(listener);
        // The metrics listener is abandoned, not drained. Lower stakes: at
        // worst a scrape in flight is cut off.
        metrics_task.abort();

        match tokio::time::timeout(grace, graceful.shutdown()).await {
            Ok(()) => tracing::info!("graceful shutdown completed"),
            Err(_) => tracing::warn!(
                "grace period of {:?} expired, forcing remaining connections closed",
                grace
            ),
        }
        conns.shutdown().await;

        Ok(())
    }

    /// Assemble the final router. Middleware nesting, innermost first: user
    /// handlers, the latency recorder, request tracing, then panic recovery
    /// outermost so it shields the whole chain. Health routes are added after
    /// the recorder layer so probes stay out of the histograms.
    fn into_router(self) -> Router {
        let mut app = self.router.layer(axum::middleware::from_fn_with_state(
            self.metrics.clone(),
            metrics::track_requests,
        ));

        for &path in health::DEFAULT_HEALTH_PATHS {
            app = app.route(path, any(health::ok));
        }
        for path in &self.health_paths {
            app = app.route(path, any(health::ok));
        }

        app.layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::custom(recovery::panic_response))
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn grace_defaults_to_two_seconds() {
        let server = Server::new(addr(), addr());
        assert_eq!(server.graceful_shutdown_duration(), Duration::from_secs(2));
    }

    #[test]
    fn grace_can_be_overridden_before_serve() {
        let mut server = Server::new(addr(), addr());
        server.set_graceful_shutdown_duration(Duration::from_millis(250));
        assert_eq!(
            server.graceful_shutdown_duration(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn registrations_chain() {
        async fn hello() -> &'static str {
            "hi"
        }

        let mut server = Server::new(addr(), addr());
        server
            .handle("/a", axum::routing::get(hello))
            .handle_prefix("/b", axum::routing::get(hello))
            .handle_fn("/c", hello);
        server.add_health_handler("/ping");
    }

    #[test]
    fn connection_scoped_errors_are_not_fatal() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(is_connection_error(&reset));

        let in_use = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        assert!(!is_connection_error(&in_use));
    }
}
