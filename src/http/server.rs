//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (request ID, tracing, timeout, pipeline)
//! - Bind server to listener with connect info for per-IP limiting
//! - Stop accepting on the shutdown broadcast and drain

use axum::{
    http::HeaderName,
    middleware,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServiceConfig;
use crate::directory::DirectoryStore;
use crate::http::handlers;
use crate::http::middleware::request_pipeline;
use crate::kv::KvClient;
use crate::loaders::Loaders;
use crate::observability::tracing::{RequestSpan, X_REQUEST_ID};
use crate::security::RateLimiter;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub kv: KvClient,
    /// `None` when the limiter is disabled.
    pub limiter: Option<RateLimiter>,
    pub loaders: Loaders,
    pub directory: Arc<dyn DirectoryStore>,
}

/// HTTP server for the directory API.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(state: AppState) -> Router {
        let request_timeout = Duration::from_secs(state.config.timeouts.request_secs);
        let x_request_id = HeaderName::from_static(X_REQUEST_ID);

        Router::new()
            .route("/health", get(handlers::health))
            .route("/users", get(handlers::list_users))
            .route("/users/{id}", get(handlers::get_user))
            .route("/users/{id}/role", get(handlers::get_user_role))
            .route("/roles", get(handlers::list_roles))
            .route("/roles/by-name/{name}", get(handlers::get_role_by_name))
            .route("/roles/{id}", get(handlers::get_role))
            .route("/roles/{id}/users", get(handlers::get_role_users))
            .layer(middleware::from_fn_with_state(state.clone(), request_pipeline))
            .with_state(state)
            .layer(
                // Outermost first: the id must exist before the span is opened.
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                    .layer(PropagateRequestIdLayer::new(x_request_id))
                    .layer(TraceLayer::new_for_http().make_span_with(RequestSpan))
                    .layer(TimeoutLayer::new(request_timeout)),
            )
    }

    /// Serve until `shutdown` fires, then drain in-flight requests.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
