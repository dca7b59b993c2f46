//! Circuit breaker for datastore and cache protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a bounded number of probes test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failures / total >= threshold over the trailing sample
//!                window, once at least `min_samples` outcomes are in it
//! Open → Half-Open: first admission attempt after `open_duration`
//! Half-Open → Closed: `half_open_probes` consecutive probe successes
//! Half-Open → Open: any probe failure (re-stamps `opened_at`)
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency (not global)
//! - Every call gets a deadline: min(caller deadline, now + timeout)
//! - Caller cancellation and bad-request class errors are never counted
//! - Outcomes that land after a transition belong to a stale generation and
//!   are dropped

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BreakerSettings;
use crate::context::RequestContext;
use crate::observability::metrics;

/// Tuning for a single breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Per-call timeout.
    pub timeout: Duration,
    /// Failure ratio in (0, 1] at which the breaker trips.
    pub error_ratio_threshold: f64,
    /// Minimum outcomes in the sample window before the ratio is evaluated.
    pub min_samples: u32,
    /// How long the breaker stays open before admitting probes.
    pub open_duration: Duration,
    /// Concurrent probes admitted in half-open, and the number of consecutive
    /// successes needed to close.
    pub half_open_probes: u32,
    /// Trailing window of outcomes considered by the ratio.
    pub sample_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            error_ratio_threshold: 0.5,
            min_samples: 10,
            open_duration: Duration::from_secs(5),
            half_open_probes: 1,
            sample_window: Duration::from_secs(10),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            error_ratio_threshold: settings.error_ratio_threshold,
            min_samples: settings.min_samples,
            open_duration: Duration::from_millis(settings.open_duration_ms),
            half_open_probes: settings.half_open_probes,
            sample_window: Duration::from_secs(settings.sample_window_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 closed, 1 half-open, 2 open.
    pub fn level(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

/// Decides whether an error returned by a wrapped call is a downstream fault.
pub trait FailureClass {
    /// `false` for bad-request class errors (missing keys, invalid input)
    /// that say nothing about the dependency's health.
    fn is_failure(&self) -> bool;
}

/// Errors surfaced by [`Breaker::run`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Fast-fail: the call was not executed.
    #[error("circuit '{name}' is open")]
    Open { name: Arc<str> },

    #[error("circuit '{name}' timed out after {after:?}")]
    Timeout { name: Arc<str>, after: Duration },

    /// The caller's context was cancelled.
    #[error("call cancelled by caller")]
    Cancelled,

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }
}

/// Point-in-time view of the breaker's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_half_open_successes: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// (completed at, was failure) for the trailing sample window.
    outcomes: VecDeque<(Instant, bool)>,
    failures_in_window: u64,
    half_open_successes: u32,
    probes_in_flight: u32,
    opened_at: Option<Instant>,
    generation: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            outcomes: VecDeque::new(),
            failures_in_window: 0,
            half_open_successes: 0,
            probes_in_flight: 0,
            opened_at: None,
            generation: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, failed)) = self.outcomes.front() {
            if now.saturating_duration_since(at) <= window {
                break;
            }
            self.outcomes.pop_front();
            if failed {
                self.failures_in_window -= 1;
            }
        }
    }

    fn reset_counters(&mut self) {
        self.outcomes.clear();
        self.failures_in_window = 0;
        self.half_open_successes = 0;
        self.probes_in_flight = 0;
    }
}

/// How a call was admitted.
struct Ticket<'a> {
    breaker: &'a Breaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Ticket<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.generation, self.probe, outcome);
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        // Dropped mid-flight (caller went away): free the probe slot.
        if !self.settled {
            self.breaker
                .record(self.generation, self.probe, Outcome::Ignored);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// A named circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct Breaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl Breaker {
    pub fn new(name: impl Into<Arc<str>>, config: BreakerConfig) -> Self {
        let name = name.into();
        metrics::record_breaker_state(&name, BreakerState::Closed.level());
        Self {
            name,
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without advancing Open → Half-Open.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let total = inner.outcomes.len() as u64;
        BreakerSnapshot {
            state: inner.state,
            successes: total - inner.failures_in_window,
            failures: inner.failures_in_window,
            consecutive_half_open_successes: inner.half_open_successes,
            opened_at: inner.opened_at,
        }
    }

    /// Execute `f` under this breaker.
    ///
    /// `f` receives a context whose deadline is the earlier of the caller's
    /// deadline and `now + timeout`, and is not invoked at all when the
    /// breaker is open.
    pub async fn run<T, E, F, Fut>(&self, ctx: &RequestContext, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClass,
    {
        if ctx.is_cancelled() {
            return Err(BreakerError::Cancelled);
        }

        let ticket = self.admit()?;

        let started = Instant::now();
        let call_ctx = ctx.with_deadline(started + self.config.timeout);
        let deadline = call_ctx.deadline().unwrap_or(started + self.config.timeout);

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            res = tokio::time::timeout_at(deadline, f(call_ctx)) => Some(res),
        };

        match result {
            None => {
                ticket.settle(Outcome::Ignored);
                Err(BreakerError::Cancelled)
            }
            Some(Err(_elapsed)) => {
                ticket.settle(Outcome::Failure);
                tracing::warn!(breaker = %self.name, "Call exceeded deadline");
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: deadline.saturating_duration_since(started),
                })
            }
            Some(Ok(Ok(value))) => {
                ticket.settle(Outcome::Success);
                Ok(value)
            }
            Some(Ok(Err(err))) => {
                let outcome = if err.is_failure() {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                ticket.settle(outcome);
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    fn admit<E>(&self) -> Result<Ticket<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.state == BreakerState::Open {
            let reopen_at = inner
                .opened_at
                .map(|at| at + self.config.open_duration)
                .unwrap_or(now);
            if now < reopen_at {
                metrics::record_breaker_rejection(&self.name);
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                });
            }
            self.transition(&mut inner, BreakerState::HalfOpen, now);
        }

        match inner.state {
            BreakerState::Closed => Ok(Ticket {
                breaker: self,
                generation: inner.generation,
                probe: false,
                settled: false,
            }),
            BreakerState::HalfOpen if inner.probes_in_flight < self.config.half_open_probes => {
                inner.probes_in_flight += 1;
                tracing::debug!(
                    breaker = %self.name,
                    in_flight = inner.probes_in_flight,
                    "Admitting half-open probe"
                );
                Ok(Ticket {
                    breaker: self,
                    generation: inner.generation,
                    probe: true,
                    settled: false,
                })
            }
            _ => {
                metrics::record_breaker_rejection(&self.name);
                Err(BreakerError::Open {
                    name: self.name.clone(),
                })
            }
        }
    }

    fn record(&self, generation: u64, probe: bool, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        match inner.state {
            BreakerState::Closed => {
                if outcome == Outcome::Ignored {
                    return;
                }
                let failed = outcome == Outcome::Failure;
                inner.outcomes.push_back((now, failed));
                if failed {
                    inner.failures_in_window += 1;
                }
                inner.prune(now, self.config.sample_window);

                let total = inner.outcomes.len() as u64;
                if failed && total >= u64::from(self.config.min_samples) {
                    let ratio = inner.failures_in_window as f64 / total as f64;
                    if ratio >= self.config.error_ratio_threshold {
                        tracing::warn!(
                            breaker = %self.name,
                            failures = inner.failures_in_window,
                            total,
                            ratio,
                            "Failure ratio crossed threshold"
                        );
                        self.transition(&mut inner, BreakerState::Open, now);
                    }
                }
            }
            BreakerState::HalfOpen if probe => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                match outcome {
                    Outcome::Success => {
                        inner.half_open_successes += 1;
                        if inner.half_open_successes >= self.config.half_open_probes {
                            self.transition(&mut inner, BreakerState::Closed, now);
                        }
                    }
                    Outcome::Failure => self.transition(&mut inner, BreakerState::Open, now),
                    Outcome::Ignored => {}
                }
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.reset_counters();
        inner.opened_at = match to {
            BreakerState::Open => Some(now),
            BreakerState::HalfOpen => inner.opened_at,
            BreakerState::Closed => None,
        };

        match to {
            BreakerState::Open => {
                tracing::warn!(breaker = %self.name, from = from.as_str(), "Circuit opened")
            }
            _ => {
                tracing::info!(
                    breaker = %self.name,
                    from = from.as_str(),
                    to = to.as_str(),
                    "Circuit state changed"
                )
            }
        }
        metrics::record_breaker_state(&self.name, to.level());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("downstream exploded")]
        Downstream,
        #[error("bad input")]
        BadInput,
    }

    impl FailureClass for TestError {
        fn is_failure(&self) -> bool {
            matches!(self, TestError::Downstream)
        }
    }

    fn s4_config() -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_millis(500),
            error_ratio_threshold: 0.5,
            min_samples: 5,
            open_duration: Duration::from_millis(100),
            half_open_probes: 1,
            sample_window: Duration::from_secs(10),
        }
    }

    async fn fail(breaker: &Breaker, ctx: &RequestContext) -> Result<(), BreakerError<TestError>> {
        breaker.run(ctx, |_| async { Err(TestError::Downstream) }).await
    }

    async fn succeed(
        breaker: &Breaker,
        ctx: &RequestContext,
    ) -> Result<(), BreakerError<TestError>> {
        breaker.run(ctx, |_| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_min_samples_and_skips_call() {
        let breaker = Breaker::new("test", s4_config());
        let ctx = RequestContext::background();

        for _ in 0..4 {
            assert!(matches!(fail(&breaker, &ctx).await, Err(BreakerError::Inner(_))));
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        assert!(matches!(fail(&breaker, &ctx).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), BreakerState::Open);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<(), BreakerError<TestError>> = breaker
            .run(&ctx, |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(res.unwrap_err().is_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_breaker() {
        let breaker = Breaker::new("test", s4_config());
        let ctx = RequestContext::background();
        for _ in 0..5 {
            let _ = fail(&breaker, &ctx).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(succeed(&breaker, &ctx).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let breaker = Breaker::new("test", s4_config());
        let ctx = RequestContext::background();
        for _ in 0..5 {
            let _ = fail(&breaker, &ctx).await;
        }
        let first_open = breaker.snapshot().opened_at;

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(matches!(fail(&breaker, &ctx).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.snapshot().opened_at > first_open);
        assert!(succeed(&breaker, &ctx).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_probes() {
        let mut config = s4_config();
        config.half_open_probes = 2;
        let breaker = Arc::new(Breaker::new("test", config));
        let ctx = RequestContext::background();
        for _ in 0..5 {
            let _ = fail(&breaker, &ctx).await;
        }
        tokio::time::advance(Duration::from_millis(100)).await;

        let slow = |b: Arc<Breaker>| async move {
            let ctx = RequestContext::background();
            b.run(&ctx, |_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, TestError>(())
            })
            .await
        };
        let p1 = tokio::spawn(slow(breaker.clone()));
        let p2 = tokio::spawn(slow(breaker.clone()));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(succeed(&breaker, &ctx).await.unwrap_err().is_open());

        assert!(p1.await.unwrap().is_ok());
        assert!(p2.await.unwrap().is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_half_open_call_frees_its_slot() {
        let breaker = Breaker::new("test", s4_config());
        let ctx = RequestContext::background();
        for _ in 0..5 {
            let _ = fail(&breaker, &ctx).await;
        }
        tokio::time::advance(Duration::from_millis(100)).await;

        // The caller gives up while the only half-open call is still pending.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            breaker.run(&ctx, |_| std::future::pending::<Result<(), TestError>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        assert!(succeed(&breaker, &ctx).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut config = s4_config();
        config.min_samples = 1;
        let breaker = Breaker::new("test", config);
        let ctx = RequestContext::background();

        let res: Result<(), BreakerError<TestError>> = breaker
            .run(&ctx, |_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            })
            .await;
        assert!(res.unwrap_err().is_timeout());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_min_of_caller_and_timeout() {
        let breaker = Breaker::new("test", s4_config());
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(50));
        let outer = ctx.deadline();

        let seen = breaker
            .run(&ctx, |inner| async move { Ok::<_, TestError>(inner.deadline()) })
            .await
            .unwrap();
        assert_eq!(seen, outer);

        let loose = RequestContext::background();
        let start = Instant::now();
        let seen = breaker
            .run(&loose, |inner| async move { Ok::<_, TestError>(inner.deadline()) })
            .await
            .unwrap();
        assert_eq!(seen, Some(start + Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_and_bad_requests_are_not_counted() {
        let mut config = s4_config();
        config.min_samples = 1;
        let breaker = Breaker::new("test", config);

        let cancelled = RequestContext::background();
        cancelled.cancel();
        let res = succeed(&breaker, &cancelled).await;
        assert!(matches!(res, Err(BreakerError::Cancelled)));

        let ctx = RequestContext::background();
        for _ in 0..10 {
            let res: Result<(), BreakerError<TestError>> =
                breaker.run(&ctx, |_| async { Err(TestError::BadInput) }).await;
            assert!(matches!(res, Err(BreakerError::Inner(TestError::BadInput))));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_flight_is_not_counted() {
        let mut config = s4_config();
        config.min_samples = 1;
        let breaker = Arc::new(Breaker::new("test", config));
        let ctx = RequestContext::background();

        let b = breaker.clone();
        let child = ctx.clone();
        let call = tokio::spawn(async move {
            b.run(&child, |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, TestError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        assert!(matches!(call.await.unwrap(), Err(BreakerError::Cancelled)));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_the_window() {
        let breaker = Breaker::new("test", s4_config());
        let ctx = RequestContext::background();
        for _ in 0..4 {
            let _ = fail(&breaker, &ctx).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&breaker, &ctx).await;

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failures, 1);
    }
}
