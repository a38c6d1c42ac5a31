//! Share link routes
//!
//! Moderators issue time-limited links; admins list, extend and revoke them.
//! Anyone holding a live token can view its landing info and download the
//! target without an account.

use crate::api::AppState;
use crate::auth::Role;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, patch},
    Json, Router,
};
use chrono::{Duration, Utc};

use super::error::{authorize, blocking, AppError, SHARE_GONE};
use super::files::stream_file;
use super::types::{
    CreateShareRequest, ExtendShareRequest, MessageResponse, ShareInfoResponse, ShareResponse,
    DEFAULT_SHARE_MINUTES, MAX_SHARE_MINUTES,
};

// ============================================================================
// ROUTES
// ============================================================================

pub fn share_routes() -> Router<AppState> {
    Router::new()
        .route("/shares", get(list_shares).post(create_share))
        .route("/shares/:token", patch(extend_share).delete(delete_share))
        .route("/share/:token", get(share_info))
        .route("/share/:token/download", get(share_download))
}

// ============================================================================
// HANDLERS
// ============================================================================

fn share_ttl(minutes: i64) -> Result<Duration, AppError> {
    if !(0..=MAX_SHARE_MINUTES).contains(&minutes) {
        return Err(AppError::BadRequest(format!(
            "expires_in_minutes must be between 0 and {}",
            MAX_SHARE_MINUTES
        )));
    }
    Ok(Duration::minutes(minutes))
}

async fn create_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateShareRequest>,
) -> Result<(StatusCode, Json<ShareResponse>), AppError> {
    let user = authorize(&state, &headers, Role::Moderator)?;
    let ttl = share_ttl(req.expires_in_minutes.unwrap_or(DEFAULT_SHARE_MINUTES))?;

    let files = state.files.clone();
    let shares = state.shares.clone();
    let record = blocking(move || -> Result<_, AppError> {
        let target = files.resolve(&req.path)?;
        Ok(shares.create(&target, ttl, files.max_archive_bytes())?)
    })
    .await?;

    tracing::info!("{} created a share of /{}", user.username, record.source);
    Ok((
        StatusCode::CREATED,
        Json(ShareResponse::from_record(record, &state.config)),
    ))
}

async fn list_shares(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ShareResponse>>, AppError> {
    authorize(&state, &headers, Role::Admin)?;

    let shares = state.shares.clone();
    let records = blocking(move || Ok::<_, AppError>(shares.list())).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| ShareResponse::from_record(r, &state.config))
            .collect(),
    ))
}

async fn extend_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(req): Json<ExtendShareRequest>,
) -> Result<Json<ShareResponse>, AppError> {
    authorize(&state, &headers, Role::Admin)?;
    let ttl = share_ttl(req.expires_in_minutes)?;

    let shares = state.shares.clone();
    let record = blocking(move || shares.extend(&token, ttl)).await?;
    Ok(Json(ShareResponse::from_record(record, &state.config)))
}

async fn delete_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    authorize(&state, &headers, Role::Admin)?;

    let shares = state.shares.clone();
    blocking(move || shares.delete(&token)).await?;
    Ok(Json(MessageResponse {
        message: "Share deleted".into(),
    }))
}

async fn share_info(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ShareInfoResponse>, AppError> {
    let shares = state.shares.clone();
    let lookup = token.clone();
    let record = blocking(move || {
        shares.sweep_quietly();
        shares.resolve(&lookup)
    })
    .await?;

    Ok(Json(ShareInfoResponse {
        name: record.download_name(),
        is_folder: record.is_folder,
        minutes_remaining: record.minutes_remaining(Utc::now()),
        download_url: format!("/share/{}/download", token),
    }))
}

async fn share_download(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let shares = state.shares.clone();
    let record = blocking(move || {
        shares.sweep_quietly();
        shares.resolve(&token)
    })
    .await?;

    tracing::info!("public download of share /{}", record.source);
    let name = record.download_name();
    stream_file(record.target_path, &name, None)
        .await
        .map_err(hide_share_target)
}

/// A target that vanished after lookup reads like any other dead link.
fn hide_share_target(err: AppError) -> AppError {
    match err {
        AppError::NotFound(_) => AppError::NotFound(SHARE_GONE.into()),
        other => other,
    }
}
