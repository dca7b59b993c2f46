//! Breaker-guarded directory store.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;

use crate::context::RequestContext;
use crate::directory::{DirectoryStore, Role, StoreError, User};
use crate::resilience::{Breaker, BreakerError};

/// Runs every call of the wrapped store inside one breaker.
#[derive(Clone)]
pub struct GuardedDirectory {
    inner: Arc<dyn DirectoryStore>,
    breaker: Arc<Breaker>,
}

impl GuardedDirectory {
    pub fn new(inner: Arc<dyn DirectoryStore>, breaker: Arc<Breaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    async fn guard<T, F, Fut>(&self, ctx: &RequestContext, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        self.breaker.run(ctx, f).await.map_err(|err| match err {
            BreakerError::Open { name } => StoreError::BreakerOpen(name.to_string()),
            BreakerError::Timeout { after, .. } => StoreError::Timeout(after),
            BreakerError::Cancelled => StoreError::Cancelled,
            BreakerError::Inner(inner) => inner,
        })
    }
}

#[async_trait]
impl DirectoryStore for GuardedDirectory {
    async fn list_users(&self, ctx: &RequestContext) -> Result<Vec<User>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.list_users(&ctx).await })
            .await
    }

    async fn list_roles(&self, ctx: &RequestContext) -> Result<Vec<Role>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.list_roles(&ctx).await })
            .await
    }

    async fn users_by_ids(
        &self,
        ctx: &RequestContext,
        ids: &[String],
    ) -> Result<Vec<User>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.users_by_ids(&ctx, ids).await })
            .await
    }

    async fn users_by_role_ids(
        &self,
        ctx: &RequestContext,
        role_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<User>>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.users_by_role_ids(&ctx, role_ids).await })
            .await
    }

    async fn roles_by_ids(
        &self,
        ctx: &RequestContext,
        ids: &[i64],
    ) -> Result<Vec<Role>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.roles_by_ids(&ctx, ids).await })
            .await
    }

    async fn roles_by_names(
        &self,
        ctx: &RequestContext,
        names: &[String],
    ) -> Result<Vec<Role>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.roles_by_names(&ctx, names).await })
            .await
    }

    async fn roles_by_user_ids(
        &self,
        ctx: &RequestContext,
        user_ids: &[String],
    ) -> Result<HashMap<String, Role>, StoreError> {
        let inner = &self.inner;
        self.guard(ctx, |ctx| async move { inner.roles_by_user_ids(&ctx, user_ids).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::directory::MemoryDirectory;
    use crate::resilience::{BreakerConfig, BreakerState};

    fn guarded(store: &MemoryDirectory) -> GuardedDirectory {
        let breaker = Breaker::new(
            "postgres_userdb",
            BreakerConfig {
                min_samples: 2,
                ..BreakerConfig::default()
            },
        );
        GuardedDirectory::new(Arc::new(store.clone()), Arc::new(breaker))
    }

    #[tokio::test]
    async fn test_outage_opens_and_skips_store() {
        let store = MemoryDirectory::seeded();
        let dir = guarded(&store);
        let ctx = RequestContext::background();
        store.set_unavailable(true);

        for _ in 0..2 {
            assert!(matches!(dir.list_roles(&ctx).await, Err(StoreError::Unavailable(_))));
        }
        assert_eq!(dir.breaker().state(), BreakerState::Open);

        let before = store.queries();
        assert!(matches!(dir.list_roles(&ctx).await, Err(StoreError::BreakerOpen(_))));
        assert_eq!(store.queries(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = MemoryDirectory::seeded();
        store.set_latency(Duration::from_secs(2));
        let dir = guarded(&store);

        let err = dir
            .list_users(&RequestContext::background())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_millis(500)));
    }
}
