//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Up to 10% extra so replicas restarting together spread out.
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Retry `op` up to `max_attempts` times, sleeping with backoff in between.
///
/// Returns the last error when every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    max_attempts: u32,
    base_ms: u64,
    max_ms: u64,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts.max(1) => return Err(e),
            Err(e) => {
                let delay = calculate_backoff(attempt, base_ms, max_ms);
                tracing::warn!(
                    what,
                    attempt,
                    delay = ?delay,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<u32, String> = retry_with_backoff("connect", 5, 10, 100, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(format!("refused #{n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(res, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<(), String> = retry_with_backoff("connect", 3, 10, 100, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(format!("refused #{n}"))
        })
        .await;
        assert_eq!(res, Err("refused #2".to_string()));
    }
}
