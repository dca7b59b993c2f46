//! Timeout enforcement for work that runs outside a breaker.
//!
//! # Responsibilities
//! - Bound a future by the context's deadline (when it has one)
//! - Abort cleanly when the context is cancelled
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Cancellation wins over an expired deadline when both are ready

use std::future::Future;
use tokio::time::timeout_at;

use crate::context::RequestContext;

/// Why a bounded future did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Drive `fut` until it completes, the context is cancelled, or the
/// context's deadline passes.
pub async fn bounded<F>(ctx: &RequestContext, fut: F) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    if ctx.is_cancelled() {
        return Err(Interrupted::Cancelled);
    }

    match ctx.deadline() {
        Some(deadline) => tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Interrupted::Cancelled),
            res = timeout_at(deadline, fut) => res.map_err(|_| Interrupted::DeadlineExceeded),
        },
        None => tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Interrupted::Cancelled),
            out = fut => Ok(out),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_respects_deadline() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(20));
        let res = bounded(&ctx, tokio::time::sleep(Duration::from_secs(1))).await;
        assert_eq!(res, Err(Interrupted::DeadlineExceeded));

        let res = bounded(&ctx, async { 7 }).await;
        assert_eq!(res, Ok(7));
    }

    #[tokio::test]
    async fn test_bounded_observes_cancellation() {
        let ctx = RequestContext::background();
        let pending = std::future::pending::<()>();
        let canceller = ctx.clone();
        tokio::spawn(async move { canceller.cancel() });

        assert_eq!(bounded(&ctx, pending).await, Err(Interrupted::Cancelled));
    }
}
