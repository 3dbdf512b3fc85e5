//! Conversion of caught handler panics into 500 responses.

use std::any::Any;

use axum::http::{header, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use http_body_util::Full;

/// Build the response served when a handler panics.
///
/// The process panic hook has already written the backtrace to stderr by the
/// time this runs; here we log the payload and keep the listener alive.
pub(crate) fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<Full<Bytes>> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic payload"
    };

    tracing::error!("request handler panicked: {}", detail);

    let mut response = Response::new(Full::from("internal server error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
