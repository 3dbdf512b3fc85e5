//! Liveness endpoints for load balancers and process supervisors.

/// Paths registered against the health responder on every server.
pub const DEFAULT_HEALTH_PATHS: &[&str] = &["/_healthz", "/_health", "/up"];

/// Answers any request with a fixed success body.
///
/// The handler is infallible; writing the response to the socket is owned by
/// the HTTP stack, and write failures surface as connection-level debug logs
/// rather than request errors.
pub async fn ok() -> &'static str {
    "ok"
}
