//! Embeddable HTTP service runtime: route registration, per-route latency
//! metrics, health endpoints, panic recovery, and signal-driven graceful
//! shutdown behind one small facade.
//!
//! The server owns two listeners: the primary one for registered routes plus
//! the default health paths, and a metrics-only one serving the Prometheus
//! scrape endpoint. Handler panics become 500s instead of crashing the
//! process, and every routed request lands in a duration histogram labeled
//! by its route template.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use axum::routing::get;
//! use servekit::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = Server::new(
//!         "0.0.0.0:3000".parse().unwrap(),
//!         "0.0.0.0:3001".parse().unwrap(),
//!     );
//!     server
//!         .handle("/widgets/:id", get(|| async { "widget" }))
//!         .handle_prefix("/assets", get(|| async { "asset" }));
//!     server.set_graceful_shutdown_duration(Duration::from_secs(5));
//!     server.serve().await;
//! }
//! ```

pub mod health;
pub mod metrics;
mod recovery;
pub mod server;
mod shutdown;

pub use crate::metrics::MetricsRegistry;
pub use crate::server::{ServeError, Server, DEFAULT_GRACEFUL_SHUTDOWN};
