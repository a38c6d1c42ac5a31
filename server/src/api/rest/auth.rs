//! Authentication routes
//!
//! Handles login, the current identity, and password changes.

use crate::api::AppState;
use crate::auth::{self, Role, ACCESS_TOKEN_HOURS};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::error::{authorize, blocking, AppError};
use super::types::{MessageResponse, UserResponse};

// ============================================================================
// ROUTES
// ============================================================================

/// Login sits on its own router so `serve` can rate limit it alone.
pub fn login_routes() -> Router<AppState> {
    Router::new().route("/auth/login", post(login))
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/me", get(me))
        .route("/auth/password", post(change_password))
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
    username: String,
    role: Role,
    /// Token lifetime in seconds
    expires_in: i64,
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    tracing::info!("Login attempt for user: {}", req.username);

    let users = state.users.clone();
    let username = req.username.clone();
    let user = blocking(move || users.verify(&username, &req.password))
        .await
        .map_err(|e| {
            tracing::warn!("Login failed for user: {}", req.username);
            e
        })?;

    let token = auth::create_token(&state.config.jwt_secret, &user.username, user.role)?;

    tracing::info!("Login successful for user: {}", user.username);

    Ok(Json(AuthResponse {
        token,
        username: user.username,
        role: user.role,
        expires_in: ACCESS_TOKEN_HOURS * 60 * 60,
    }))
}

async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserResponse>, AppError> {
    let user = authorize(&state, &headers, Role::User)?;
    Ok(Json(user.into()))
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let user = authorize(&state, &headers, Role::User)?;

    let users = state.users.clone();
    blocking(move || {
        users
            .verify(&user.username, &req.current_password)
            .map_err(|_| AppError::BadRequest("Current password is incorrect".into()))?;
        users
            .set_password(&user.username, &req.new_password)
            .map_err(AppError::from)
    })
    .await?;

    Ok(Json(MessageResponse {
        message: "Password updated".into(),
    }))
}
