//! Admin routes
//!
//! User management and server info.

use crate::api::AppState;
use crate::auth::Role;
use crate::db::UserUpdate;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::error::{authorize, blocking, AppError};
use super::types::{MessageResponse, UserResponse};

// ============================================================================
// ROUTES
// ============================================================================

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/:name", patch(update_user).delete(delete_user))
        .route("/server/info", get(get_server_info))
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Serialize)]
struct ServerInfo {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: Role,
}

fn default_role() -> Role {
    Role::User
}

#[derive(Deserialize)]
struct UpdateUserRequest {
    username: Option<String>,
    role: Option<Role>,
    /// Empty keeps the current password
    password: Option<String>,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn get_server_info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(ServerInfo {
        name: state.config.site_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserResponse>>, AppError> {
    authorize(&state, &headers, Role::Admin)?;
    Ok(Json(state.users.list().into_iter().map(Into::into).collect()))
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let admin = authorize(&state, &headers, Role::Admin)?;

    let users = state.users.clone();
    let user = blocking(move || users.create(&req.username, &req.password, req.role)).await?;

    tracing::info!("{} created user {}", admin.username, user.username);
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let admin = authorize(&state, &headers, Role::Admin)?;

    let update = UserUpdate {
        username: req.username.filter(|u| !u.trim().is_empty()),
        role: req.role,
        password: req.password.filter(|p| !p.is_empty()),
    };
    let users = state.users.clone();
    let user = blocking(move || users.update(&name, update)).await?;

    tracing::info!("{} updated user {}", admin.username, user.username);
    Ok(Json(user.into()))
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let admin = authorize(&state, &headers, Role::Admin)?;

    if name.trim().to_lowercase() == admin.username {
        return Err(AppError::BadRequest("You cannot delete your own account".into()));
    }

    let users = state.users.clone();
    let target = name.clone();
    blocking(move || users.delete(&target)).await?;

    tracing::info!("{} deleted user {}", admin.username, name);
    Ok(Json(MessageResponse {
        message: "User deleted".into(),
    }))
}
