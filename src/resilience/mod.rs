//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound call (KV command, directory query):
//!     → circuit_breaker.rs (fast-fail when open, deadline = min(caller, timeout),
//!                           failure accounting)
//!     → timeouts.rs (bound background work by the request's deadline/cancellation)
//!
//! Startup connection to the KV backend:
//!     → backoff.rs (jittered exponential retries)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Caller-initiated cancellation never poisons a breaker
//! - No retries on the request path; the loader and limiter call exactly once

pub mod backoff;
pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{Breaker, BreakerConfig, BreakerError, BreakerState, FailureClass};
