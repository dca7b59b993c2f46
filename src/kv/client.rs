//! Breaker-wrapped façade over a [`KvBackend`].

use std::sync::Arc;
use std::time::Duration;

use crate::context::RequestContext;
use crate::kv::{KeyTtl, KvBackend, KvError, KvValue, Script};
use crate::resilience::{Breaker, BreakerError};

/// Shared handle to the key/value store.
///
/// Cloning is cheap; every clone shares the backend (and therefore the
/// connection pool) and the breaker.
#[derive(Clone)]
pub struct KvClient {
    backend: Arc<dyn KvBackend>,
    breaker: Arc<Breaker>,
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("backend", &self.backend.describe())
            .field("breaker", &self.breaker.name())
            .finish()
    }
}

impl KvClient {
    pub fn new(backend: Arc<dyn KvBackend>, breaker: Arc<Breaker>) -> Self {
        Self { backend, breaker }
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    /// Raw string value. A missing key is [`KvError::NotFound`].
    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<String, KvError> {
        let backend = &self.backend;
        let value = self
            .guard(ctx, "get", |_| async move { backend.get(key).await })
            .await?;
        value.ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    pub async fn get_i64(&self, ctx: &RequestContext, key: &str) -> Result<i64, KvError> {
        let raw = self.get(ctx, key).await?;
        raw.trim().parse().map_err(|_| KvError::Parse {
            key: key.to_string(),
            value: raw,
        })
    }

    /// Only `"0"` and `"1"` are booleans.
    pub async fn get_bool(&self, ctx: &RequestContext, key: &str) -> Result<bool, KvError> {
        let raw = self.get(ctx, key).await?;
        match raw.as_str() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(KvError::Parse {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    pub async fn set(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: impl ToString,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let backend = &self.backend;
        let value = value.to_string();
        let value = value.as_str();
        self.guard(ctx, "set", |_| async move { backend.set(key, value, ttl).await })
            .await
    }

    /// Number of keys removed.
    pub async fn del(&self, ctx: &RequestContext, key: &str) -> Result<u64, KvError> {
        let backend = &self.backend;
        self.guard(ctx, "del", |_| async move { backend.del(key).await })
            .await
    }

    pub async fn exists(&self, ctx: &RequestContext, key: &str) -> Result<bool, KvError> {
        let backend = &self.backend;
        let count = self
            .guard(ctx, "exists", |_| async move { backend.exists(key).await })
            .await?;
        Ok(count >= 1)
    }

    /// Remaining lifetime: `None` for a key without expiry,
    /// [`KvError::NotFound`] for a missing key.
    pub async fn ttl(&self, ctx: &RequestContext, key: &str) -> Result<Option<Duration>, KvError> {
        let backend = &self.backend;
        let ttl = self
            .guard(ctx, "ttl", |_| async move { backend.ttl(key).await })
            .await?;
        match ttl {
            KeyTtl::Missing => Err(KvError::NotFound(key.to_string())),
            KeyTtl::Persistent => Ok(None),
            KeyTtl::Expires(left) => Ok(Some(left)),
        }
    }

    /// Run `script` atomically against the store.
    pub async fn eval(
        &self,
        ctx: &RequestContext,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<KvValue, KvError> {
        let backend = &self.backend;
        self.guard(ctx, script.name(), |_| async move {
            backend.eval(script, keys, args).await
        })
        .await
    }

    pub async fn ping(&self, ctx: &RequestContext) -> Result<(), KvError> {
        let backend = &self.backend;
        self.guard(ctx, "ping", |_| async move { backend.ping().await })
            .await
    }

    /// Release the backend. Not guarded: closing must work while the
    /// breaker is open.
    pub async fn close(&self) -> Result<(), KvError> {
        tracing::info!(backend = %self.backend.describe(), "Closing kv client");
        self.backend.close().await
    }

    async fn guard<T, F, Fut>(&self, ctx: &RequestContext, op: &str, f: F) -> Result<T, KvError>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, KvError>>,
    {
        let result = self.breaker.run(ctx, f).await.map_err(|err| match err {
            BreakerError::Open { name } => KvError::BreakerOpen(name.to_string()),
            BreakerError::Timeout { after, .. } => KvError::Timeout(after),
            BreakerError::Cancelled => KvError::Cancelled,
            BreakerError::Inner(inner) => inner,
        });
        if let Err(err) = &result {
            if !err.is_not_found() && !matches!(err, KvError::Cancelled) {
                tracing::warn!(op, error = %err, "kv call failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryBackend;
    use crate::resilience::{BreakerConfig, BreakerState};

    fn client() -> (Arc<MemoryBackend>, KvClient) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(10_000)));
        let backend = Arc::new(MemoryBackend::new(clock));
        let breaker = Arc::new(Breaker::new(
            "redis_userdb",
            BreakerConfig {
                min_samples: 3,
                ..BreakerConfig::default()
            },
        ));
        (backend.clone(), KvClient::new(backend, breaker))
    }

    #[tokio::test]
    async fn test_typed_getters() {
        let (_, kv) = client();
        let ctx = RequestContext::background();
        kv.set(&ctx, "n", 42, None).await.unwrap();
        kv.set(&ctx, "flag", "1", None).await.unwrap();
        kv.set(&ctx, "word", "yes", None).await.unwrap();

        assert_eq!(kv.get_i64(&ctx, "n").await.unwrap(), 42);
        assert!(kv.get_bool(&ctx, "flag").await.unwrap());
        assert!(matches!(
            kv.get_bool(&ctx, "word").await,
            Err(KvError::Parse { .. })
        ));
        assert!(matches!(kv.get_i64(&ctx, "word").await, Err(KvError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_a_breaker_failure() {
        let (_, kv) = client();
        let ctx = RequestContext::background();
        for _ in 0..10 {
            assert!(kv.get(&ctx, "absent").await.unwrap_err().is_not_found());
        }
        assert_eq!(kv.breaker().state(), BreakerState::Closed);
        assert_eq!(kv.breaker().snapshot().failures, 0);
    }

    #[tokio::test]
    async fn test_ttl_and_exists() {
        let (_, kv) = client();
        let ctx = RequestContext::background();
        kv.set(&ctx, "session", "x", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        kv.set(&ctx, "forever", "x", None).await.unwrap();

        assert_eq!(
            kv.ttl(&ctx, "session").await.unwrap(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(kv.ttl(&ctx, "forever").await.unwrap(), None);
        assert!(kv.ttl(&ctx, "nope").await.unwrap_err().is_not_found());
        assert!(kv.exists(&ctx, "session").await.unwrap());
        assert!(!kv.exists(&ctx, "nope").await.unwrap());
        assert_eq!(kv.del(&ctx, "session").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backend_outage_opens_breaker() {
        let (backend, kv) = client();
        let ctx = RequestContext::background();
        backend.set_unavailable(true);
        for _ in 0..3 {
            assert!(matches!(kv.ping(&ctx).await, Err(KvError::Backend(_))));
        }
        assert_eq!(kv.breaker().state(), BreakerState::Open);
        assert!(matches!(kv.ping(&ctx).await, Err(KvError::BreakerOpen(_))));
    }

    #[tokio::test]
    async fn test_close_bypasses_open_breaker() {
        let (backend, kv) = client();
        let ctx = RequestContext::background();
        backend.set_unavailable(true);
        for _ in 0..3 {
            let _ = kv.ping(&ctx).await;
        }
        assert!(kv.close().await.is_ok());
        backend.set_unavailable(false);
        assert_eq!(backend.get("k").await, Err(KvError::Closed));
    }
}
