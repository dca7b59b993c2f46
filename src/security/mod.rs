//! Request admission.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (sliding window per client IP, atomic script on the KV store)
//!     → headers.rs (RateLimit-* / Retry-After written onto the response)
//!     → Pass to handlers
//! ```
//!
//! # Design Decisions
//! - Fail open: a KV outage never turns into a 5xx from the limiter
//! - Counting happens in the store, not in process, so replicas agree
//! - No trust in client input: the identifier is the socket peer address

pub mod headers;
pub mod rate_limit;

pub use rate_limit::{LimiterError, LimiterField, LimiterOptions, RateLimiter, Verdict};
