//! Sliding-window rate limiter over the key/value store.
//!
//! The window is rolled up into fixed buckets. Each bucket is one counter
//! under `rl:{name}:{scope}:{identifier}:{bucket_start_secs}`; a decision sums
//! the buckets covering the window and, if under the limit, increments the
//! current one. Both steps run in one atomic script, so concurrent replicas
//! sharing the store never admit more than the limit.
//!
//! The limiter fails open: when the store is unreachable (or its breaker is
//! open) the request is admitted and the error is reported to the caller.

use std::time::Duration;
use axum::http::header::{HeaderMap, RETRY_AFTER};

use crate::clock::SharedClock;
use crate::config::LimiterSettings;
use crate::context::RequestContext;
use crate::kv::{KvClient, KvError, KvValue, Script, ScriptEnv};
use crate::observability::metrics;
use crate::security::headers::{set_numeric, RATELIMIT_LIMIT, RATELIMIT_REMAINING, RATELIMIT_RESET};

/// Sum the window, refuse at the limit, otherwise count this hit.
///
/// `KEYS = [current bucket, ...prior buckets]`, `ARGV = [limit, ttl_secs]`.
/// Returns `{count, incremented}`.
const SLIDING_WINDOW_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local count = 0
for _, key in ipairs(KEYS) do
  local hits = redis.call('GET', key)
  if hits then
    count = count + tonumber(hits)
  end
end
if count >= limit then
  return {count, 0}
end
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return {count + 1, 1}
"#;

fn sliding_window(
    env: &mut dyn ScriptEnv,
    keys: &[String],
    args: &[String],
) -> Result<KvValue, KvError> {
    let arg = |i: usize| -> Result<i64, KvError> {
        args.get(i)
            .and_then(|a| a.parse().ok())
            .ok_or_else(|| KvError::Rejected(format!("ARGV[{}] must be an integer", i + 1)))
    };
    let limit = arg(0)?;
    let ttl = arg(1)?;
    let current = keys
        .first()
        .ok_or_else(|| KvError::Rejected("at least one key is required".into()))?;

    let mut count: i64 = 0;
    for key in keys {
        if let Some(hits) = env.get(key) {
            count += hits
                .parse::<i64>()
                .map_err(|_| KvError::Rejected(format!("bucket {key} is not an integer")))?;
        }
    }
    if count >= limit {
        return Ok(KvValue::Array(vec![KvValue::Int(count), KvValue::Int(0)]));
    }
    if env.incr_by(current, 1)? == 1 {
        env.expire(current, Duration::from_secs(ttl.max(0) as u64));
    }
    Ok(KvValue::Array(vec![KvValue::Int(count + 1), KvValue::Int(1)]))
}

pub const SLIDING_WINDOW: Script =
    Script::new("sliding_window", SLIDING_WINDOW_LUA, sliding_window);

/// Errors from the limiter.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("invalid limiter options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("unexpected script reply: {0:?}")]
    UnexpectedReply(KvValue),
}

/// What a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterField {
    pub scope: String,
    pub identifier: String,
}

impl LimiterField {
    pub fn new(scope: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            identifier: identifier.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimiterOptions {
    pub name: String,
    /// Requests admitted per window. Named for the common one-minute window.
    pub limit_per_minute: u64,
    pub window_interval: Duration,
    /// Must divide `window_interval` and be a whole number of seconds.
    pub bucket_interval: Duration,
    pub write_headers: bool,
}

impl LimiterOptions {
    pub fn validate(&self) -> Result<(), LimiterError> {
        let invalid = |msg: String| Err(LimiterError::InvalidOptions(msg));
        if self.name.is_empty() {
            return invalid("name must not be empty".into());
        }
        if self.limit_per_minute == 0 {
            return invalid("limit_per_minute must be at least 1".into());
        }
        let bucket_ms = self.bucket_interval.as_millis();
        let window_ms = self.window_interval.as_millis();
        if bucket_ms == 0 || window_ms == 0 {
            return invalid("window and bucket intervals must be non-zero".into());
        }
        if bucket_ms % 1_000 != 0 {
            return invalid(format!(
                "bucket interval {:?} is not a whole number of seconds",
                self.bucket_interval
            ));
        }
        if window_ms % bucket_ms != 0 {
            return invalid(format!(
                "bucket interval {:?} does not divide window interval {:?}",
                self.bucket_interval, self.window_interval
            ));
        }
        Ok(())
    }

    fn buckets_per_window(&self) -> u64 {
        (self.window_interval.as_millis() / self.bucket_interval.as_millis()) as u64
    }
}

impl From<&LimiterSettings> for LimiterOptions {
    fn from(settings: &LimiterSettings) -> Self {
        Self {
            name: settings.name.clone(),
            limit_per_minute: settings.limit_per_minute,
            window_interval: Duration::from_secs(settings.window_interval_secs),
            bucket_interval: Duration::from_secs(settings.bucket_interval_secs),
            write_headers: settings.write_headers,
        }
    }
}

/// The outcome of one limiter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub throttled: bool,
    /// Hits in the window after this decision.
    pub count: u64,
    /// Whole seconds until the current bucket closes (at least 1).
    pub reset_secs: u64,
}

/// A named sliding-window limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    kv: KvClient,
    clock: SharedClock,
    options: LimiterOptions,
}

impl RateLimiter {
    pub fn new(
        kv: KvClient,
        clock: SharedClock,
        options: LimiterOptions,
    ) -> Result<Self, LimiterError> {
        options.validate()?;
        Ok(Self { kv, clock, options })
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Decide whether a request for `field` should be throttled, writing the
    /// rate-limit headers into `headers` when enabled.
    ///
    /// Fails open: on `Err` the request must be admitted. Throttling is only
    /// ever reported as `Ok(true)`. No headers are written on `Err`.
    pub async fn should_throttle(
        &self,
        ctx: &RequestContext,
        headers: &mut HeaderMap,
        field: &LimiterField,
    ) -> Result<bool, LimiterError> {
        let verdict = match self.decide(ctx, field).await {
            Ok(verdict) => verdict,
            Err(err) => {
                metrics::record_limiter_error(&self.options.name);
                tracing::error!(
                    limiter = %self.options.name,
                    scope = %field.scope,
                    error = %err,
                    "Rate limiter unavailable, admitting request"
                );
                return Err(err);
            }
        };

        if self.options.write_headers {
            self.write_headers(headers, &verdict);
        }
        if verdict.throttled {
            metrics::record_rate_limited(&field.scope);
            tracing::debug!(
                limiter = %self.options.name,
                scope = %field.scope,
                identifier = %field.identifier,
                count = verdict.count,
                "Throttled"
            );
        }
        Ok(verdict.throttled)
    }

    /// Run the atomic window check for `field` at the current clock time.
    pub async fn decide(
        &self,
        ctx: &RequestContext,
        field: &LimiterField,
    ) -> Result<Verdict, LimiterError> {
        let now_ms = self.clock.now().as_millis() as u64;
        let bucket_ms = self.options.bucket_interval.as_millis() as u64;
        let bucket_start_ms = now_ms / bucket_ms * bucket_ms;

        let keys = self.bucket_keys(field, bucket_start_ms / 1_000);
        let ttl = self.options.window_interval + self.options.bucket_interval;
        let limit = self.options.limit_per_minute.min(i64::MAX as u64);
        let args = [limit.to_string(), ttl.as_secs().to_string()];

        let reply = self.kv.eval(ctx, &SLIDING_WINDOW, &keys, &args).await?;
        let (count, incremented) = match reply.clone().into_array().as_deref() {
            Some([count, incremented]) => match (count.as_i64(), incremented.as_i64()) {
                (Some(c), Some(i)) => (c.max(0) as u64, i),
                _ => return Err(LimiterError::UnexpectedReply(reply)),
            },
            _ => return Err(LimiterError::UnexpectedReply(reply)),
        };

        let until_close_ms = bucket_start_ms + bucket_ms - now_ms;
        Ok(Verdict {
            throttled: incremented == 0,
            count,
            reset_secs: until_close_ms.div_ceil(1_000).max(1),
        })
    }

    /// Keys for the buckets covering the window, current bucket first.
    fn bucket_keys(&self, field: &LimiterField, bucket_start_secs: u64) -> Vec<String> {
        let bucket_secs = self.options.bucket_interval.as_secs();
        (0..self.options.buckets_per_window())
            .filter_map(|k| bucket_start_secs.checked_sub(k * bucket_secs))
            .map(|start| {
                format!(
                    "rl:{}:{}:{}:{}",
                    self.options.name, field.scope, field.identifier, start
                )
            })
            .collect()
    }

    fn write_headers(&self, headers: &mut HeaderMap, verdict: &Verdict) {
        let limit = self.options.limit_per_minute;
        set_numeric(headers, RATELIMIT_LIMIT, limit);
        set_numeric(headers, RATELIMIT_REMAINING, limit.saturating_sub(verdict.count));
        set_numeric(headers, RATELIMIT_RESET, verdict.reset_secs);
        if verdict.throttled {
            set_numeric(headers, RETRY_AFTER, verdict.reset_secs);
        }
    }
}
