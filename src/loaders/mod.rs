//! Request-scoped batch loaders.
//!
//! # Data Flow
//! ```text
//! Request entry (http/pipeline.rs):
//!     Loaders::attach(ctx) → fresh LoaderSet in the request extensions
//! Handler:
//!     set.users_by_ids.load(id)   ─┐
//!     set.users_by_ids.load(id2)  ─┼→ loader.rs (one batch per quantum)
//!                                  └→ directory.rs (BatchFn over DirectoryStore)
//!                                      → GuardedDirectory (breaker + timeout)
//! Request exit:
//!     LoaderSet dropped, context cancelled
//! ```
//!
//! # Design Decisions
//! - No state survives the request: every request gets new caches
//! - A missing row is `Ok(None)`, an error is per slot
//! - Integer-keyed domains use `i64` keys end to end

pub mod directory;
pub mod loader;

use std::sync::Arc;

use crate::context::RequestContext;
use crate::directory::{DirectoryStore, Role, StoreError, User};
use crate::error::{AppError, ErrorKind};

pub use loader::{BatchFn, LoadHandle, LoadResult, Loader};

/// Errors delivered to a loader slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoaderError {
    #[error("request cancelled")]
    Cancelled,

    /// The batch fetch failed; every slot in the batch carries the same error.
    #[error("{message}")]
    Fetch { kind: ErrorKind, message: String },

    #[error("batch returned {got} results for {expected} keys")]
    Misaligned { expected: usize, got: usize },
}

impl From<StoreError> for LoaderError {
    fn from(err: StoreError) -> Self {
        if err == StoreError::Cancelled {
            return LoaderError::Cancelled;
        }
        let app = AppError::from(err);
        LoaderError::Fetch {
            kind: app.kind(),
            message: app.message().to_string(),
        }
    }
}

/// The loaders of one request.
#[derive(Debug, Clone)]
pub struct LoaderSet {
    pub users_by_ids: Loader<String, User>,
    pub users_by_role_id: Loader<i64, Vec<User>>,
    pub role_by_user_id: Loader<String, Role>,
    pub roles_by_ids: Loader<i64, Role>,
    pub roles_by_names: Loader<String, Role>,
}

impl LoaderSet {
    pub fn prime_users(&self, users: &[User]) {
        for user in users {
            self.users_by_ids.prime(user.user_id.clone(), user.clone());
        }
    }

    /// Prime both role loaders.
    pub fn prime_roles(&self, roles: &[Role]) {
        for role in roles {
            self.roles_by_ids.prime(role.id, role.clone());
            self.roles_by_names
                .prime(role.name.as_str().to_string(), role.clone());
        }
    }
}

/// Builds a fresh [`LoaderSet`] per request.
#[derive(Clone)]
pub struct Loaders {
    store: Arc<dyn DirectoryStore>,
    max_batch_size: usize,
}

impl Loaders {
    pub fn new(store: Arc<dyn DirectoryStore>, max_batch_size: usize) -> Self {
        Self {
            store,
            max_batch_size,
        }
    }

    /// Loaders bound to `ctx`: their batches observe its cancellation and
    /// deadline.
    pub fn attach(&self, ctx: &RequestContext) -> LoaderSet {
        use directory::{RoleByUserId, RolesByIds, RolesByNames, UsersByIds, UsersByRoleId};

        let store = &self.store;
        let max = self.max_batch_size;
        LoaderSet {
            users_by_ids: Loader::new(
                "users_by_ids",
                ctx.clone(),
                Arc::new(UsersByIds(store.clone())),
                max,
            ),
            users_by_role_id: Loader::new(
                "users_by_role_id",
                ctx.clone(),
                Arc::new(UsersByRoleId(store.clone())),
                max,
            ),
            role_by_user_id: Loader::new(
                "role_by_user_id",
                ctx.clone(),
                Arc::new(RoleByUserId(store.clone())),
                max,
            ),
            roles_by_ids: Loader::new(
                "roles_by_ids",
                ctx.clone(),
                Arc::new(RolesByIds(store.clone())),
                max,
            ),
            roles_by_names: Loader::new(
                "roles_by_names",
                ctx.clone(),
                Arc::new(RolesByNames(store.clone())),
                max,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_errors_keep_their_class() {
        assert_eq!(LoaderError::from(StoreError::Cancelled), LoaderError::Cancelled);
        assert_eq!(
            LoaderError::from(StoreError::Timeout(Duration::from_millis(500))),
            LoaderError::Fetch {
                kind: ErrorKind::Timeout,
                message: "Upstream timed out".into()
            }
        );
        let err = LoaderError::from(StoreError::BreakerOpen("db".into()));
        let LoaderError::Fetch { kind, .. } = err else {
            panic!("expected fetch error");
        };
        assert_eq!(kind, ErrorKind::BreakerOpen);
    }
}
