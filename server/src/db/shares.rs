//! Registry of time-limited public share links.
//!
//! Records live in `shares.json`; folder shares own an archive under
//! `shares/<token>/`, a directory that belongs to exactly one token and is
//! removed together with the record.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{load_snapshot, persist_snapshot};
use crate::storage::archive::{self, ArchiveError};
use crate::storage::ResolvedPath;

/// Random bytes per token; 32 bytes encode to 43 URL-safe characters.
const TOKEN_BYTES: usize = 32;
const TOKEN_LEN: usize = 43;

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("Share not found")]
    NotFound,
    #[error("Share expired")]
    Expired,
    #[error("Folder is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("Invalid expiry")]
    InvalidTtl,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Archive error: {0}")]
    Archive(ArchiveError),
}

impl From<ArchiveError> for ShareError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::TooLarge { size, limit } => ShareError::TooLarge { size, limit },
            other => ShareError::Archive(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub token: String,
    /// The shared file itself, or the generated archive for a folder.
    pub target_path: PathBuf,
    /// What was shared, relative to the root.
    pub source: String,
    pub is_folder: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ShareRecord {
    /// Expired from the deadline onward, so a zero TTL is never resolvable.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole minutes left, rounded up.
    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> i64 {
        let seconds = (self.expires_at - now).num_seconds();
        if seconds <= 0 {
            0
        } else {
            (seconds + 59) / 60
        }
    }

    /// Name offered to the downloader.
    pub fn download_name(&self) -> String {
        self.target_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub artifacts_removed: usize,
}

type ShareMap = BTreeMap<String, ShareRecord>;

pub struct ShareStore {
    snapshot_path: PathBuf,
    artifacts_dir: PathBuf,
    writer: Mutex<()>,
    current: RwLock<Arc<ShareMap>>,
}

/// A fresh token from the OS-seeded generator.
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Shape check done before a token is used as a map key or path component.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, ShareError> {
    if ttl < Duration::zero() {
        return Err(ShareError::InvalidTtl);
    }
    now.checked_add_signed(ttl).ok_or(ShareError::InvalidTtl)
}

impl ShareStore {
    /// Load `shares.json` from `data_dir` and drop artifact directories that
    /// no record owns.
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        let snapshot_path = data_dir.join("shares.json");
        let artifacts_dir = data_dir.join("shares");
        fs::create_dir_all(&artifacts_dir)?;

        let mut shares: ShareMap = load_snapshot(&snapshot_path, "share registry")?;
        shares.retain(|token, record| {
            record.token = token.clone();
            is_valid_token(token)
        });

        let store = Self {
            snapshot_path,
            artifacts_dir,
            writer: Mutex::new(()),
            current: RwLock::new(Arc::new(shares)),
        };
        store.purge_orphans()?;

        tracing::info!("Loaded {} share records", store.snapshot().len());
        Ok(store)
    }

    /// Live records from `shares.json`, soonest expiry first, read without
    /// sweeping or purging anything.
    ///
    /// Safe next to a running server, which owns the file and the artifacts.
    pub fn peek(data_dir: &Path) -> io::Result<Vec<ShareRecord>> {
        let shares: ShareMap = load_snapshot(&data_dir.join("shares.json"), "share registry")?;
        let now = Utc::now();
        let mut records: Vec<_> = shares
            .into_iter()
            .filter(|(token, _)| is_valid_token(token))
            .map(|(token, record)| ShareRecord { token, ..record })
            .filter(|record| !record.is_expired(now) && record.target_path.exists())
            .collect();
        records.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(records)
    }

    fn snapshot(&self) -> Arc<ShareMap> {
        self.current.read().clone()
    }

    /// Persist `next` and publish it. Caller must hold the writer lock.
    fn commit(&self, next: ShareMap) -> io::Result<()> {
        persist_snapshot(&self.snapshot_path, &next)?;
        *self.current.write() = Arc::new(next);
        Ok(())
    }

    fn artifact_dir(&self, token: &str) -> PathBuf {
        self.artifacts_dir.join(token)
    }

    /// Delete the token-owned directory holding a folder share's archive.
    fn remove_artifact(&self, record: &ShareRecord) -> bool {
        if !record.is_folder {
            return false;
        }
        let dir = self.artifact_dir(&record.token);
        if !record.target_path.starts_with(&dir) {
            tracing::warn!(
                "share {} points outside its artifact directory, leaving it",
                record.token
            );
            return false;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("failed to remove artifact {}: {}", dir.display(), e);
                false
            }
        }
    }

    fn purge_orphans(&self) -> io::Result<()> {
        let shares = self.snapshot();
        for entry in fs::read_dir(&self.artifacts_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !shares.contains_key(&name) && entry.file_type()?.is_dir() {
                tracing::info!("removing orphaned share artifact {}", name);
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }

    /// Issue a share for `target`.
    ///
    /// Folders are archived first, outside the writer lock; the archive is
    /// removed again if the record cannot be persisted.
    pub fn create(
        &self,
        target: &ResolvedPath,
        ttl: Duration,
        max_archive_bytes: u64,
    ) -> Result<ShareRecord, ShareError> {
        self.sweep_quietly();

        let now = Utc::now();
        let expires_at = deadline(now, ttl)?;
        let token = generate_token();
        let is_folder = target.as_path().is_dir();

        let target_path = if is_folder {
            archive::build_share_artifact(
                target.as_path(),
                &self.artifact_dir(&token),
                max_archive_bytes,
            )?
        } else {
            target.as_path().to_path_buf()
        };

        let record = ShareRecord {
            token: token.clone(),
            target_path,
            source: target.display_relative(),
            is_folder,
            created_at: now,
            expires_at,
        };

        {
            let _writer = self.writer.lock();
            let mut next = (*self.snapshot()).clone();
            next.insert(token, record.clone());
            if let Err(e) = self.commit(next) {
                self.remove_artifact(&record);
                return Err(e.into());
            }
        }

        tracing::info!(
            folder = record.is_folder,
            "shared /{} until {}",
            record.source,
            record.expires_at
        );
        Ok(record)
    }

    /// Look up a live share. Expired records and records whose target has
    /// vanished resolve as `Expired` even before a sweep removes them.
    pub fn resolve(&self, token: &str) -> Result<ShareRecord, ShareError> {
        if !is_valid_token(token) {
            return Err(ShareError::NotFound);
        }
        let shares = self.snapshot();
        let record = shares.get(token).ok_or(ShareError::NotFound)?;
        if record.is_expired(Utc::now()) || !record.target_path.exists() {
            return Err(ShareError::Expired);
        }
        Ok(record.clone())
    }

    /// Remove every expired record, persisting once if anything changed.
    pub fn sweep(&self) -> io::Result<SweepReport> {
        let _writer = self.writer.lock();
        let now = Utc::now();
        let current = self.snapshot();

        let (stale, live): (Vec<_>, Vec<_>) = current
            .values()
            .cloned()
            .partition(|r| r.is_expired(now) || !r.target_path.exists());
        if stale.is_empty() {
            return Ok(SweepReport::default());
        }

        let next: ShareMap = live.into_iter().map(|r| (r.token.clone(), r)).collect();
        self.commit(next)?;

        let mut report = SweepReport {
            removed: stale.len(),
            artifacts_removed: 0,
        };
        for record in &stale {
            if self.remove_artifact(record) {
                report.artifacts_removed += 1;
            }
        }

        tracing::info!(
            removed = report.removed,
            artifacts = report.artifacts_removed,
            "swept expired shares"
        );
        Ok(report)
    }

    /// Sweep before an operation; a failed sweep is logged and ignored.
    pub fn sweep_quietly(&self) {
        if let Err(e) = self.sweep() {
            tracing::warn!("share sweep failed: {}", e);
        }
    }

    pub fn delete(&self, token: &str) -> Result<ShareRecord, ShareError> {
        self.sweep_quietly();

        let removed = {
            let _writer = self.writer.lock();
            let mut next = (*self.snapshot()).clone();
            let removed = next.remove(token).ok_or(ShareError::NotFound)?;
            self.commit(next)?;
            removed
        };
        self.remove_artifact(&removed);

        tracing::info!("deleted share of /{}", removed.source);
        Ok(removed)
    }

    /// Reset a live share's deadline to `now + ttl`.
    pub fn extend(&self, token: &str, ttl: Duration) -> Result<ShareRecord, ShareError> {
        self.sweep_quietly();

        let _writer = self.writer.lock();
        let mut next = (*self.snapshot()).clone();
        let record = next.get_mut(token).ok_or(ShareError::NotFound)?;
        record.expires_at = deadline(Utc::now(), ttl)?;
        let updated = record.clone();
        self.commit(next)?;

        tracing::info!("share of /{} now expires {}", updated.source, updated.expires_at);
        Ok(updated)
    }

    /// Live shares, soonest expiry first.
    pub fn list(&self) -> Vec<ShareRecord> {
        self.sweep_quietly();
        let mut records: Vec<_> = self.snapshot().values().cloned().collect();
        records.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        records
    }

    /// Sweep on a fixed period in addition to the access-triggered sweeps.
    pub fn spawn_sweeper(self: Arc<Self>, period: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let store = self.clone();
                match tokio::task::spawn_blocking(move || store.sweep()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("periodic share sweep failed: {}", e),
                    Err(e) => tracing::error!("share sweeper task panicked: {}", e),
                }
            }
        })
    }
}
