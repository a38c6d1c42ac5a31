//! Error handling for REST API
//!
//! Provides the `AppError` type used across all REST endpoints, the
//! conversions from core errors, and the bearer-token gate.

use crate::api::AppState;
use crate::auth::{self, Role};
use crate::db::{ShareError, User, UserError};
use crate::storage::FsError;
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal(String),
}

/// Share lookups never reveal whether a link existed and expired.
pub(super) const SHARE_GONE: &str = "invalid or expired link";

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => {
                // Full details stay in the server log
                tracing::error!(details = %msg, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred".to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<FsError> for AppError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::PathViolation(_) => AppError::BadRequest("Invalid path".into()),
            FsError::NotFound(path) => AppError::NotFound(format!("Not found: {}", path)),
            FsError::InvalidName(_) | FsError::InvalidTarget(_) => {
                AppError::BadRequest(err.to_string())
            }
            FsError::NameConflict(_) | FsError::AlreadyExists(_) => {
                AppError::Conflict(err.to_string())
            }
            FsError::CapacityExceeded { .. } => AppError::PayloadTooLarge(err.to_string()),
            FsError::Io(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::NotFound | ShareError::Expired => AppError::NotFound(SHARE_GONE.into()),
            ShareError::TooLarge { .. } => AppError::PayloadTooLarge(err.to_string()),
            ShareError::InvalidTtl => AppError::BadRequest(err.to_string()),
            ShareError::Io(e) => AppError::Internal(e.to_string()),
            ShareError::Archive(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<UserError> for AppError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound(_) => AppError::NotFound(err.to_string()),
            UserError::AlreadyExists(_) => AppError::Conflict(err.to_string()),
            UserError::InvalidUsername(_) | UserError::WeakPassword => {
                AppError::BadRequest(err.to_string())
            }
            UserError::InvalidCredentials => AppError::Unauthorized("Invalid credentials".into()),
            UserError::Io(e) => AppError::Internal(e.to_string()),
            UserError::Hash(e) => AppError::Internal(e.to_string()),
        }
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Authenticate the bearer token and require at least `required`.
///
/// The role comes from the user registry, not from the token, so a demoted
/// or deleted account loses access without waiting for token expiry.
pub fn authorize(state: &AppState, headers: &HeaderMap, required: Role) -> Result<User, AppError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Invalid authorization format".into()))?;

    let claims = auth::verify_token(&state.config.jwt_secret, token)
        .map_err(|_| AppError::Unauthorized("Invalid or expired token".into()))?;

    let user = state
        .users
        .get(&claims.sub)
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists".into()))?;

    if !auth::allowed(user.role, required) {
        tracing::warn!(user = %user.username, role = %user.role, required = %required, "access denied");
        return Err(AppError::Forbidden(format!("Requires {} access", required)));
    }
    Ok(user)
}

/// Run blocking filesystem work off the async workers.
pub async fn blocking<T, E, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {}", e)))?
        .map_err(Into::into)
}
