//! Directory route handlers.
//!
//! Handlers read through the request's loaders; list endpoints go to the
//! store directly and prime the loaders with what they fetched.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::directory::{Role, User};
use crate::error::AppError;
use crate::http::request::{parse_id, RequestScope};
use crate::http::server::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub kv: String,
}

/// Liveness. A failing KV only degrades the report; the service keeps
/// serving with the limiter failing open.
pub async fn health(State(state): State<AppState>, scope: RequestScope) -> Json<HealthResponse> {
    let kv = match state.kv.ping(&scope.ctx).await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(error = %err, "KV health check failed");
            "degraded"
        }
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        kv: kv.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct UsersQuery {
    /// Comma-separated user ids.
    pub ids: Option<String>,
}

pub async fn list_users(
    State(state): State<AppState>,
    scope: RequestScope,
    Query(query): Query<UsersQuery>,
) -> Result<Json<Vec<User>>, AppError> {
    if let Some(ids) = query.ids.as_deref() {
        let ids: Vec<String> = ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();

        let mut users = Vec::with_capacity(ids.len());
        for slot in scope.loaders.users_by_ids.load_many(ids).await {
            if let Some(user) = slot? {
                users.push(User::clone(&user));
            }
        }
        return Ok(Json(users));
    }

    let users = state.directory.list_users(&scope.ctx).await?;
    scope.loaders.prime_users(&users);
    Ok(Json(users))
}

pub async fn get_user(scope: RequestScope, Path(id): Path<String>) -> Result<Json<User>, AppError> {
    match scope.loaders.users_by_ids.load(id.clone()).await? {
        Some(user) => Ok(Json(User::clone(&user))),
        None => Err(AppError::not_found(format!("User '{id}' not found"))),
    }
}

pub async fn get_user_role(
    scope: RequestScope,
    Path(id): Path<String>,
) -> Result<Json<Role>, AppError> {
    // Load both together so they share one quantum.
    let (user, role) = tokio::join!(
        scope.loaders.users_by_ids.load(id.clone()),
        scope.loaders.role_by_user_id.load(id.clone()),
    );
    if user?.is_none() {
        return Err(AppError::not_found(format!("User '{id}' not found")));
    }
    match role? {
        Some(role) => Ok(Json(Role::clone(&role))),
        None => Err(AppError::not_found(format!("Role for user '{id}' not found"))),
    }
}

pub async fn list_roles(
    State(state): State<AppState>,
    scope: RequestScope,
) -> Result<Json<Vec<Role>>, AppError> {
    let roles = state.directory.list_roles(&scope.ctx).await?;
    scope.loaders.prime_roles(&roles);
    Ok(Json(roles))
}

pub async fn get_role(
    scope: RequestScope,
    Path(raw): Path<String>,
) -> Result<Json<Role>, AppError> {
    let id = parse_id(&raw)?;
    match scope.loaders.roles_by_ids.load(id).await? {
        Some(role) => Ok(Json(Role::clone(&role))),
        None => Err(AppError::not_found(format!("Role {id} not found"))),
    }
}

pub async fn get_role_users(
    scope: RequestScope,
    Path(raw): Path<String>,
) -> Result<Json<Vec<User>>, AppError> {
    let id = parse_id(&raw)?;
    let (role, users) = tokio::join!(
        scope.loaders.roles_by_ids.load(id),
        scope.loaders.users_by_role_id.load(id),
    );
    if role?.is_none() {
        return Err(AppError::not_found(format!("Role {id} not found")));
    }
    let users = users?.map(|users| Vec::clone(&users)).unwrap_or_default();
    scope.loaders.prime_users(&users);
    Ok(Json(users))
}

pub async fn get_role_by_name(
    scope: RequestScope,
    Path(name): Path<String>,
) -> Result<Json<Role>, AppError> {
    match scope.loaders.roles_by_names.load(name.clone()).await? {
        Some(role) => Ok(Json(Role::clone(&role))),
        None => Err(AppError::not_found(format!("Role '{name}' not found"))),
    }
}
