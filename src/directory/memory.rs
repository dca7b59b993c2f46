//! In-process directory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::context::RequestContext;
use crate::directory::{DirectoryStore, Role, RoleName, StoreError, User};

/// A [`DirectoryStore`] held in memory.
///
/// Every query counts towards [`queries`](Self::queries), which is how tests
/// observe batching.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    users: Arc<DashMap<String, User>>,
    roles: Arc<DashMap<i64, Role>>,
    queries: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three built-in roles and a handful of users.
    pub fn seeded() -> Self {
        let dir = Self::new();
        for (id, name) in [(1, RoleName::Guest), (2, RoleName::User), (3, RoleName::Developer)] {
            dir.insert_role(Role { id, name });
        }
        for (id, username, role) in [
            ("1", "alice", RoleName::Developer),
            ("2", "bob", RoleName::User),
            ("3", "carol", RoleName::Guest),
            ("4", "dave", RoleName::User),
        ] {
            dir.insert_user(User {
                user_id: id.to_string(),
                username: username.to_string(),
                role,
            });
        }
        dir
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.user_id.clone(), user);
    }

    pub fn insert_role(&self, role: Role) {
        self.roles.insert(role.id, role);
    }

    /// Queries served so far.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn enter(&self) -> Result<(), StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory directory marked unavailable".into()));
        }
        Ok(())
    }

    fn role_named(&self, name: RoleName) -> Option<Role> {
        self.roles
            .iter()
            .find(|r| r.value().name == name)
            .map(|r| r.value().clone())
    }

    fn sorted_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|r| r.value().clone()).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn list_users(&self, _ctx: &RequestContext) -> Result<Vec<User>, StoreError> {
        self.enter().await?;
        Ok(self.sorted_users())
    }

    async fn list_roles(&self, _ctx: &RequestContext) -> Result<Vec<Role>, StoreError> {
        self.enter().await?;
        let mut roles: Vec<Role> = self.roles.iter().map(|r| r.value().clone()).collect();
        roles.sort_by_key(|r| r.id);
        Ok(roles)
    }

    async fn users_by_ids(
        &self,
        _ctx: &RequestContext,
        ids: &[String],
    ) -> Result<Vec<User>, StoreError> {
        self.enter().await?;
        Ok(ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn users_by_role_ids(
        &self,
        _ctx: &RequestContext,
        role_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<User>>, StoreError> {
        self.enter().await?;
        let mut grouped: HashMap<i64, Vec<User>> = HashMap::new();
        let users = self.sorted_users();
        for role_id in role_ids {
            let Some(role) = self.roles.get(role_id).map(|r| r.value().clone()) else {
                continue;
            };
            let members: Vec<User> = users
                .iter()
                .filter(|u| u.role == role.name)
                .cloned()
                .collect();
            if !members.is_empty() {
                grouped.insert(*role_id, members);
            }
        }
        Ok(grouped)
    }

    async fn roles_by_ids(
        &self,
        _ctx: &RequestContext,
        ids: &[i64],
    ) -> Result<Vec<Role>, StoreError> {
        self.enter().await?;
        Ok(ids
            .iter()
            .filter_map(|id| self.roles.get(id).map(|r| r.value().clone()))
            .collect())
    }

    async fn roles_by_names(
        &self,
        _ctx: &RequestContext,
        names: &[String],
    ) -> Result<Vec<Role>, StoreError> {
        self.enter().await?;
        Ok(names
            .iter()
            .filter_map(|name| name.parse::<RoleName>().ok())
            .filter_map(|name| self.role_named(name))
            .collect())
    }

    async fn roles_by_user_ids(
        &self,
        _ctx: &RequestContext,
        user_ids: &[String],
    ) -> Result<HashMap<String, Role>, StoreError> {
        self.enter().await?;
        let mut roles = HashMap::new();
        for id in user_ids {
            let Some(role_name) = self.users.get(id).map(|u| u.value().role) else {
                continue;
            };
            if let Some(role) = self.role_named(role_name) {
                roles.insert(id.clone(), role);
            }
        }
        Ok(roles)
    }
}
