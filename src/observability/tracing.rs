//! Request spans.
//!
//! # Responsibilities
//! - Open one span per inbound request for `TraceLayer`
//! - Tag it with the request id so every event below it correlates
//!
//! # Design Decisions
//! - The request id is read from `x-request-id`, which `SetRequestIdLayer`
//!   fills in before the trace layer runs

use axum::http::Request;
use tower_http::trace::MakeSpan;
use tracing::Span;

/// Header carrying the correlation id.
pub const X_REQUEST_ID: &str = "x-request-id";

/// `MakeSpan` that records method, path and request id.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");

        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            request_id = %request_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_is_created_without_request_id() {
        let request = Request::builder().uri("/health").body(()).unwrap();
        // No subscriber is installed, so the span is disabled but must not panic.
        let _span = RequestSpan.make_span(&request);
    }
}
