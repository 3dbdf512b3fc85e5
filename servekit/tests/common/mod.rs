#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;

use servekit::{ServeError, Server};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static TRACING_INIT: Once = Once::new();

/// Route logs through the capturing test writer, once per test binary.
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init();
    });
}

/// A server running on ephemeral ports, torn down when dropped.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), ServeError>>>,
}

impl ServerHandle {
    /// Bind both listeners on port 0, apply `configure`, and spawn the
    /// server.
    pub async fn start(configure: impl FnOnce(&mut Server)) -> Self {
        setup_tracing();

        let shutdown = CancellationToken::new();
        let mut server = Server::with_shutdown(
            shutdown.clone(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
        );
        configure(&mut server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let metrics_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let metrics_addr = metrics_listener.local_addr().unwrap();

        let task = tokio::spawn(server.try_serve_on(listener, metrics_listener));

        Self {
            addr,
            metrics_addr,
            shutdown,
            task: Some(task),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.metrics_addr)
    }

    /// Fire the cancellation signal without waiting for the server to stop.
    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Fire the cancellation signal and wait for serve to return.
    pub async fn stop(mut self) -> Result<(), ServeError> {
        self.shutdown.cancel();
        self.task
            .take()
            .expect("server already stopped")
            .await
            .expect("server task panicked")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
