//! Batch functions over the [`DirectoryStore`].
//!
//! Each one issues a single store query for the whole batch and re-aligns
//! the unordered rows with the requested keys.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use async_trait::async_trait;

use crate::context::RequestContext;
use crate::directory::{DirectoryStore, Role, User};
use crate::loaders::{BatchFn, LoaderError};

/// Position each value at its key; keys without a row get `None`.
fn align<K, V>(keys: &[K], mut rows: HashMap<K, V>) -> Vec<Option<V>>
where
    K: Eq + Hash,
{
    keys.iter().map(|key| rows.remove(key)).collect()
}

pub struct UsersByIds(pub Arc<dyn DirectoryStore>);

#[async_trait]
impl BatchFn<String, User> for UsersByIds {
    async fn load(
        &self,
        ctx: &RequestContext,
        keys: &[String],
    ) -> Result<Vec<Option<User>>, LoaderError> {
        let users = self.0.users_by_ids(ctx, keys).await?;
        let rows = users.into_iter().map(|u| (u.user_id.clone(), u)).collect();
        Ok(align(keys, rows))
    }
}

pub struct UsersByRoleId(pub Arc<dyn DirectoryStore>);

#[async_trait]
impl BatchFn<i64, Vec<User>> for UsersByRoleId {
    async fn load(
        &self,
        ctx: &RequestContext,
        keys: &[i64],
    ) -> Result<Vec<Option<Vec<User>>>, LoaderError> {
        let grouped = self.0.users_by_role_ids(ctx, keys).await?;
        Ok(align(keys, grouped))
    }
}

pub struct RoleByUserId(pub Arc<dyn DirectoryStore>);

#[async_trait]
impl BatchFn<String, Role> for RoleByUserId {
    async fn load(
        &self,
        ctx: &RequestContext,
        keys: &[String],
    ) -> Result<Vec<Option<Role>>, LoaderError> {
        let roles = self.0.roles_by_user_ids(ctx, keys).await?;
        Ok(align(keys, roles))
    }
}

pub struct RolesByIds(pub Arc<dyn DirectoryStore>);

#[async_trait]
impl BatchFn<i64, Role> for RolesByIds {
    async fn load(
        &self,
        ctx: &RequestContext,
        keys: &[i64],
    ) -> Result<Vec<Option<Role>>, LoaderError> {
        let roles = self.0.roles_by_ids(ctx, keys).await?;
        let rows = roles.into_iter().map(|r| (r.id, r)).collect();
        Ok(align(keys, rows))
    }
}

/// Keys are matched case-insensitively.
pub struct RolesByNames(pub Arc<dyn DirectoryStore>);

#[async_trait]
impl BatchFn<String, Role> for RolesByNames {
    async fn load(
        &self,
        ctx: &RequestContext,
        keys: &[String],
    ) -> Result<Vec<Option<Role>>, LoaderError> {
        let roles = self.0.roles_by_names(ctx, keys).await?;
        let rows: HashMap<String, Role> = roles
            .into_iter()
            .map(|r| (r.name.as_str().to_string(), r))
            .collect();
        Ok(keys
            .iter()
            .map(|key| rows.get(&key.to_ascii_lowercase()).cloned())
            .collect())
    }
}
