//! File routes
//!
//! Listing, uploads, entry operations and downloads under the root directory.

use crate::api::AppState;
use crate::auth::Role;
use crate::storage::{BatchReport, CleanupGuard, Download, Preview, UploadItem};
use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::path::PathBuf;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;

use super::error::{authorize, blocking, AppError};
use super::types::{
    CreateFolderRequest, EntryResponse, ListDirectoryResponse, MessageResponse, MoveRequest,
    PathQuery, PathRequest, RenameRequest, SaveContentRequest, UploadResponse,
};

// ============================================================================
// ROUTES
// ============================================================================

pub fn file_routes() -> Router<AppState> {
    Router::new()
        .route("/files/list", get(list_directory))
        .route("/files/upload", post(upload_files))
        .route("/files/upload-folder", post(upload_folder))
        .route("/files/move", post(move_entry))
        .route("/files/rename", post(rename_entry))
        .route("/files/delete", post(delete_entry))
        .route("/files/folder", post(create_folder))
        .route("/files/content", put(save_content))
        .route("/files/preview", get(preview))
        .route("/files/download", get(download))
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn list_directory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Json<ListDirectoryResponse>, AppError> {
    authorize(&state, &headers, Role::User)?;

    let files = state.files.clone();
    let path = query.path.clone();
    let listing = blocking(move || files.list(&path)).await?;

    Ok(Json(ListDirectoryResponse {
        path: query.path,
        directories: listing.directories,
        files: listing.files,
    }))
}

async fn upload_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let user = authorize(&state, &headers, Role::Moderator)?;
    let (folder, items) = read_upload_form(multipart).await?;
    let attempted = attempted_count(&items);

    tracing::info!("{} uploading {} files to /{}", user.username, attempted, folder);
    let files = state.files.clone();
    let report = blocking(move || files.upload(&folder, items)).await?;
    Ok(batch_response(&state, report, attempted))
}

async fn upload_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let user = authorize(&state, &headers, Role::Moderator)?;
    let (folder, items) = read_upload_form(multipart).await?;
    let attempted = attempted_count(&items);

    tracing::info!("{} uploading a folder of {} files to /{}", user.username, attempted, folder);
    let files = state.files.clone();
    let report = blocking(move || files.upload_folder(&folder, items)).await?;
    Ok(batch_response(&state, report, attempted))
}

async fn move_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MoveRequest>,
) -> Result<Json<EntryResponse>, AppError> {
    authorize(&state, &headers, Role::Moderator)?;

    let files = state.files.clone();
    let moved = blocking(move || files.move_entry(&req.source, &req.destination)).await?;
    Ok(Json(entry_response(&state, moved)))
}

async fn rename_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RenameRequest>,
) -> Result<Json<EntryResponse>, AppError> {
    authorize(&state, &headers, Role::Moderator)?;

    let files = state.files.clone();
    let renamed = blocking(move || files.rename(&req.path, &req.new_name)).await?;
    Ok(Json(entry_response(&state, renamed)))
}

async fn delete_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PathRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let user = authorize(&state, &headers, Role::Moderator)?;

    let files = state.files.clone();
    let path = req.path.clone();
    blocking(move || files.delete(&path)).await?;

    tracing::info!("{} deleted /{}", user.username, req.path);
    Ok(Json(MessageResponse {
        message: "Deleted".into(),
    }))
}

async fn create_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateFolderRequest>,
) -> Result<(StatusCode, Json<EntryResponse>), AppError> {
    authorize(&state, &headers, Role::Moderator)?;

    let files = state.files.clone();
    let created = blocking(move || files.create_folder(&req.parent, &req.name)).await?;
    Ok((StatusCode::CREATED, Json(entry_response(&state, created))))
}

async fn save_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SaveContentRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    authorize(&state, &headers, Role::Moderator)?;

    let files = state.files.clone();
    blocking(move || files.save_content(&req.path, &req.content)).await?;
    Ok(Json(MessageResponse {
        message: "Saved".into(),
    }))
}

async fn preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Json<Preview>, AppError> {
    authorize(&state, &headers, Role::User)?;

    let files = state.files.clone();
    let preview = blocking(move || files.preview(&query.path)).await?;
    Ok(Json(preview))
}

async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Response, AppError> {
    authorize(&state, &headers, Role::User)?;

    let files = state.files.clone();
    let prepared = blocking(move || files.prepare_download(&query.path)).await?;

    match prepared {
        Download::File { path, name } => stream_file(path, &name, None).await,
        Download::Archive(archive) => {
            let ticket = state.cleanup.schedule(archive.dir.clone());
            stream_file(archive.zip_path, &archive.file_name, Some(ticket.into_guard())).await
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Collect `current_folder` and every file field of an upload form.
async fn read_upload_form(mut multipart: Multipart) -> Result<(String, Vec<UploadItem>), AppError> {
    let mut folder = String::new();
    let mut items = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!("Multipart parsing error: {}", e);
        AppError::BadRequest(format!("Invalid upload: {}", e))
    })? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "current_folder" => {
                folder = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Invalid folder: {}", e)))?;
            }
            "files" | "file" => {
                let name = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read {}: {}", name, e)))?;
                items.push(UploadItem {
                    name,
                    data: data.to_vec(),
                });
            }
            other => {
                tracing::debug!("Ignoring upload field {}", other);
            }
        }
    }

    Ok((folder, items))
}

fn attempted_count(items: &[UploadItem]) -> usize {
    items.iter().filter(|i| !i.name.trim().is_empty()).count()
}

/// 200 with the per-file report, or 500 when every attempted file failed.
fn batch_response(state: &AppState, report: BatchReport, attempted: usize) -> Response {
    let status = if report.saved.is_empty() && attempted > 0 {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    let guard = state.files.guard();
    let body = UploadResponse {
        saved: report
            .saved
            .iter()
            .filter_map(|p| guard.display_relative(p))
            .collect(),
        failed: report.failed,
    };
    (status, Json(body)).into_response()
}

fn entry_response(state: &AppState, path: PathBuf) -> EntryResponse {
    EntryResponse {
        path: state
            .files
            .guard()
            .display_relative(&path)
            .unwrap_or_default(),
    }
}

/// `Content-Disposition` with an ASCII fallback and an RFC 5987 UTF-8 name.
pub(super) fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(name.len() * 3);
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }

    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Stream a file from disk. `guard`, if any, lives as long as the body, so
/// its directory is removed once the response finishes or is abandoned.
pub(super) async fn stream_file(
    path: PathBuf,
    name: &str,
    guard: Option<CleanupGuard>,
) -> Result<Response, AppError> {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("Not found: {}", name)));
        }
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    let content_type_header = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    tracing::debug!("Serving {} (size: {} bytes, type: {})", name, size, content_type);

    let mut reader = ReaderStream::new(file);
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = reader.next().await {
            yield chunk;
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, content_type_header)
        .header(header::CONTENT_LENGTH, size)
        .header(header::CONTENT_DISPOSITION, content_disposition(name))
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}
