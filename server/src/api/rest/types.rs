//! Shared types for REST API
//!
//! Common request/response structs used across multiple endpoint modules.

use crate::auth::Role;
use crate::config::Config;
use crate::db::ShareRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// FILE REQUESTS
// ============================================================================

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Deserialize)]
pub struct MoveRequest {
    pub source: String,
    #[serde(default)]
    pub destination: String,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub path: String,
    pub new_name: String,
}

#[derive(Deserialize)]
pub struct CreateFolderRequest {
    #[serde(default)]
    pub parent: String,
    pub name: String,
}

#[derive(Deserialize)]
pub struct SaveContentRequest {
    pub path: String,
    pub content: String,
}

// ============================================================================
// FILE RESPONSES
// ============================================================================

#[derive(Serialize)]
pub struct ListDirectoryResponse {
    pub path: String,
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    /// Saved entries, relative to the root
    pub saved: Vec<String>,
    /// Original names of the files that could not be saved
    pub failed: Vec<String>,
}

#[derive(Serialize)]
pub struct EntryResponse {
    pub path: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

// ============================================================================
// SHARES
// ============================================================================

/// Default lifetime of a new share link
pub const DEFAULT_SHARE_MINUTES: i64 = 60;

/// Longest lifetime accepted for a share link (one year)
pub const MAX_SHARE_MINUTES: i64 = 365 * 24 * 60;

#[derive(Deserialize)]
pub struct CreateShareRequest {
    pub path: String,
    pub expires_in_minutes: Option<i64>,
}

#[derive(Deserialize)]
pub struct ExtendShareRequest {
    pub expires_in_minutes: i64,
}

#[derive(Serialize)]
pub struct ShareResponse {
    pub token: String,
    pub url: String,
    pub source: String,
    pub is_folder: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub minutes_remaining: i64,
}

impl ShareResponse {
    pub fn from_record(record: ShareRecord, config: &Config) -> Self {
        let minutes_remaining = record.minutes_remaining(Utc::now());
        Self {
            url: config.share_url(&record.token),
            token: record.token,
            source: record.source,
            is_folder: record.is_folder,
            created_at: record.created_at,
            expires_at: record.expires_at,
            minutes_remaining,
        }
    }
}

/// Public view of a share link; never exposes server paths.
#[derive(Serialize)]
pub struct ShareInfoResponse {
    pub name: String,
    pub is_folder: bool,
    pub minutes_remaining: i64,
    pub download_url: String,
}

// ============================================================================
// USERS
// ============================================================================

#[derive(Serialize)]
pub struct UserResponse {
    pub username: String,
    pub role: Role,
}

impl From<crate::db::User> for UserResponse {
    fn from(user: crate::db::User) -> Self {
        Self {
            username: user.username,
            role: user.role,
        }
    }
}
