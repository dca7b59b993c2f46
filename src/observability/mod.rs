//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (limiter, breaker, loader and request metrics)
//!     → tracing.rs (one span per request, tagged with its request id)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through all subsystems via the request span
//! - Metrics go through the `metrics` facade and cost nothing when disabled

pub mod logging;
pub mod metrics;
pub mod tracing;
