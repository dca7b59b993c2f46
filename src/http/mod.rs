//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request id, trace span, timeout)
//!     → middleware/pipeline.rs (context, per-IP limiter, loader set)
//!     → request.rs (RequestScope extractor)
//!     → handlers.rs (directory routes via loaders)
//!     → response.rs (JSON errors)
//!     → Send to client, limiter headers merged
//! ```

pub mod handlers;
pub mod middleware;
pub mod request;
pub mod response;
pub mod server;

pub use request::RequestScope;
pub use server::{AppState, HttpServer};
