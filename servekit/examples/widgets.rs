//! Minimal embedding: a widget API with health endpoints, a metrics
//! listener, and graceful shutdown on Ctrl+C.
//!
//! ```sh
//! cargo run --example widgets
//! curl localhost:3000/widgets/42
//! curl localhost:3000/up
//! curl localhost:3001/metrics
//! ```

use axum::extract::Path;
use axum::routing::get;
use envconfig::Envconfig;
use servekit::Server;

#[derive(Envconfig)]
struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    host: String,

    #[envconfig(from = "BIND_PORT", default = "3000")]
    port: u16,

    #[envconfig(from = "METRICS_PORT", default = "3001")]
    metrics_port: u16,
}

impl Config {
    fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn metrics_bind(&self) -> String {
        format!("{}:{}", self.host, self.metrics_port)
    }
}

async fn get_widget(Path(id): Path<String>) -> String {
    format!("widget {id}\n")
}

async fn boom() -> &'static str {
    panic!("demo panic, the server keeps running")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let mut server = Server::new(
        config.bind().parse().expect("invalid bind address"),
        config
            .metrics_bind()
            .parse()
            .expect("invalid metrics bind address"),
    );

    server
        .handle("/widgets/:id", get(get_widget))
        .handle("/boom", get(boom))
        .handle_prefix("/assets", get(|| async { "static asset\n" }));
    server.add_health_handler("/healthz");

    server.serve().await;
}
