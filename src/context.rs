//! Request-scoped carrier threaded through every outbound call.
//!
//! # Responsibilities
//! - Carry the caller's remote address and request id
//! - Carry an optional deadline (tightened by each breaker on the way down)
//! - Propagate cancellation from the inbound request to nested calls
//!
//! Contexts form a tree: derived contexts share the parent's identity, never
//! loosen its deadline, and are cancelled when the parent is.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request carrier.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Option<Arc<str>>,
    remote_addr: Option<IpAddr>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A context for work that is not tied to an inbound request.
    pub fn background() -> Self {
        Self {
            request_id: None,
            remote_addr: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A root context for an inbound request.
    pub fn for_request(request_id: impl Into<Arc<str>>, remote_addr: Option<IpAddr>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            remote_addr,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context whose deadline is the earlier of the current one and
    /// `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            request_id: self.request_id.clone(),
            remote_addr: self.remote_addr,
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Derive a context that expires `timeout` from now (or earlier).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
