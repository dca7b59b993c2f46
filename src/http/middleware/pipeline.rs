//! Per-request pipeline.
//!
//! Builds the request scope, applies the per-IP limiter, then runs the
//! handler. Limiter headers are merged into whatever the handler returns.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::AppError;
use crate::http::request::RequestScope;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::observability::tracing::X_REQUEST_ID;
use crate::security::headers::merge_limiter_headers;
use crate::security::LimiterField;

/// Limiter scope for anonymous per-address limits.
pub const IP_SCOPE: &str = "ip";

pub async fn request_pipeline(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let ctx = RequestContext::for_request(request_id, remote_ip)
        .with_timeout(Duration::from_secs(state.config.timeouts.request_secs));

    // 1. Limiter. Errors admit the request.
    let mut limiter_headers = HeaderMap::new();
    if let Some(limiter) = &state.limiter {
        let identifier = ctx
            .remote_addr()
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        let field = LimiterField::new(IP_SCOPE, identifier);
        if let Ok(true) = limiter.should_throttle(&ctx, &mut limiter_headers, &field).await {
            ctx.cancel();
            let mut response = AppError::throttled().into_response();
            merge_limiter_headers(&limiter_headers, response.headers_mut());
            metrics::record_request(&method, response.status().as_u16(), start);
            return response;
        }
    }

    // 2. Fresh loaders for this request only.
    let scope = RequestScope {
        loaders: state.loaders.attach(&ctx),
        ctx: ctx.clone(),
    };
    req.extensions_mut().insert(scope);

    // 3. Dispatch. Dropping the request drops its scope; cancelling stops
    //    any batch still in flight.
    let mut response = next.run(req).await;
    ctx.cancel();

    merge_limiter_headers(&limiter_headers, response.headers_mut());
    metrics::record_request(&method, response.status().as_u16(), start);
    response
}
