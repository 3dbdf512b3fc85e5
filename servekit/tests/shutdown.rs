mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use axum::routing::get;
use common::ServerHandle;
use servekit::{ServeError, Server};
use tokio_util::sync::CancellationToken;

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(300)).await;
    "done"
}

async fn very_slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(30)).await;
    "never"
}

#[tokio::test]
async fn in_flight_requests_finish_within_the_grace_period() -> Result<()> {
    let server = ServerHandle::start(|s| {
        s.handle("/slow", get(slow));
    })
    .await;

    let client = reqwest::Client::new();
    let url = server.url("/slow");
    let request = tokio::spawn(async move { client.get(url).send().await });

    // Let the request reach the handler before firing the signal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    let serve_result = server.stop().await;

    let response = request.await??;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await?, "done");
    assert!(serve_result.is_ok());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "clean drain should finish well before the deadline"
    );
    Ok(())
}

#[tokio::test]
async fn grace_deadline_forces_slow_connections_closed() -> Result<()> {
    let server = ServerHandle::start(|s| {
        s.set_graceful_shutdown_duration(Duration::from_millis(300));
        s.handle("/very-slow", get(very_slow));
    })
    .await;

    let client = reqwest::Client::new();
    let url = server.url("/very-slow");
    let request = tokio::spawn(async move { client.get(url).send().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    let serve_result = server.stop().await;
    let elapsed = started.elapsed();

    assert!(serve_result.is_ok(), "forced close is a normal outcome");
    assert!(
        elapsed >= Duration::from_millis(250),
        "stop honored the deadline, returned after {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "forced close should not hang, returned after {elapsed:?}"
    );

    let outcome = request.await?;
    assert!(
        outcome.is_err(),
        "a forcibly closed connection should surface as a client error"
    );
    Ok(())
}

#[tokio::test]
async fn pre_cancelled_token_stops_serve_immediately() -> Result<()> {
    common::setup_tracing();

    let token = CancellationToken::new();
    token.cancel();

    let mut server = Server::with_shutdown(
        token,
        "127.0.0.1:0".parse()?,
        "127.0.0.1:0".parse()?,
    );
    server.handle("/x", get(|| async { "x" }));

    let result = tokio::time::timeout(Duration::from_secs(2), server.try_serve()).await;
    assert!(matches!(result, Ok(Ok(()))));
    Ok(())
}

#[tokio::test]
async fn bind_failure_surfaces_as_error() -> Result<()> {
    common::setup_tracing();

    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = occupied.local_addr()?;

    let server = Server::with_shutdown(CancellationToken::new(), addr, "127.0.0.1:0".parse()?);

    match server.try_serve().await {
        Err(ServeError::Bind { .. }) => {}
        other => panic!("expected a bind error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn metrics_listener_is_abandoned_after_drain() -> Result<()> {
    let server = ServerHandle::start(|_| {}).await;
    let metrics_url = server.metrics_url();

    let client = reqwest::Client::new();
    assert_eq!(client.get(&metrics_url).send().await?.status(), 200);

    server.stop().await?;

    // A fresh client so the check dials a new connection instead of reusing
    // a pooled one that predates the shutdown.
    let fresh = reqwest::Client::new();
    let after = fresh.get(&metrics_url).send().await;
    assert!(
        after.is_err(),
        "metrics listener should be down after shutdown"
    );
    Ok(())
}
