//! User directory datastore.
//!
//! # Data Flow
//! ```text
//! Loaders / handlers
//!     → guarded.rs (GuardedDirectory: every call inside the directory breaker)
//!     → DirectoryStore capability
//!         → memory.rs (seeded in-process store with fault injection)
//! ```
//!
//! # Design Decisions
//! - Batch-shaped queries only: the loaders are the sole per-key callers
//! - Missing rows are absent from results, never errors

pub mod guarded;
pub mod memory;
pub mod models;

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;

use crate::context::RequestContext;
use crate::resilience::FailureClass;

pub use guarded::GuardedDirectory;
pub use memory::MemoryDirectory;
pub use models::{Role, RoleName, User};

/// Errors from the directory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The query itself was malformed (bad id, unknown role name).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("circuit '{0}' is open")]
    BreakerOpen(String),

    #[error("datastore call timed out after {0:?}")]
    Timeout(Duration),

    #[error("datastore call cancelled")]
    Cancelled,
}

impl FailureClass for StoreError {
    fn is_failure(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Batch queries over users and roles.
///
/// Results are unordered and omit ids that match nothing.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn list_users(&self, ctx: &RequestContext) -> Result<Vec<User>, StoreError>;

    async fn list_roles(&self, ctx: &RequestContext) -> Result<Vec<Role>, StoreError>;

    async fn users_by_ids(
        &self,
        ctx: &RequestContext,
        ids: &[String],
    ) -> Result<Vec<User>, StoreError>;

    /// Users grouped by role id.
    async fn users_by_role_ids(
        &self,
        ctx: &RequestContext,
        role_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<User>>, StoreError>;

    async fn roles_by_ids(
        &self,
        ctx: &RequestContext,
        ids: &[i64],
    ) -> Result<Vec<Role>, StoreError>;

    async fn roles_by_names(
        &self,
        ctx: &RequestContext,
        names: &[String],
    ) -> Result<Vec<Role>, StoreError>;

    /// The role of each user, keyed by user id.
    async fn roles_by_user_ids(
        &self,
        ctx: &RequestContext,
        user_ids: &[String],
    ) -> Result<HashMap<String, Role>, StoreError>;
}
