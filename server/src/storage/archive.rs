//! Zip archives of directory subtrees.
//!
//! Two destinations exist: ephemeral download archives in a fresh scratch
//! directory (deleted by the caller once the response is done), and share
//! artifacts in a directory owned by exactly one share token. In both cases
//! the source size is checked before the zip is written, and a failed build
//! removes its own output so a partial archive is never served.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::error::FsError;

/// Entries at or above this size need ZIP64 headers.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Prefix of ephemeral download directories inside the scratch root.
const SCRATCH_PREFIX: &str = "dl-";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Source tree is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<ArchiveError> for FsError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::TooLarge { size, limit } => FsError::CapacityExceeded { size, limit },
            ArchiveError::Io(e) => FsError::Io(e),
            other => FsError::Io(io::Error::other(other.to_string())),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub bytes: u64,
}

/// A download archive living in its own scratch directory.
#[derive(Debug)]
pub struct EphemeralArchive {
    pub dir: PathBuf,
    pub zip_path: PathBuf,
    pub file_name: String,
}

/// Total size of the regular files under `source`. Symlinks are not followed
/// and do not count.
pub fn tree_size(source: &Path) -> Result<u64, ArchiveError> {
    let mut total = 0u64;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total = total.saturating_add(entry.metadata()?.len());
        }
    }
    Ok(total)
}

fn check_size(source: &Path, max_bytes: u64) -> Result<u64, ArchiveError> {
    let size = tree_size(source)?;
    if size > max_bytes {
        tracing::info!(size, limit = max_bytes, "archive source too large");
        return Err(ArchiveError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(size)
}

/// Archive `source` into `destination`.
///
/// Fails with `TooLarge` before creating `destination` when the source tree
/// exceeds `max_bytes`. Any later failure removes the partial file.
pub fn build(
    source: &Path,
    destination: &Path,
    max_bytes: u64,
) -> Result<ArchiveSummary, ArchiveError> {
    check_size(source, max_bytes)?;
    write_archive(source, destination).map_err(|e| {
        let _ = fs::remove_file(destination);
        e
    })
}

/// Build a download archive in a new directory under `scratch_root`.
///
/// The directory is the caller's to delete once the response is finished.
/// On failure it is removed before returning.
pub fn build_ephemeral(
    source: &Path,
    scratch_root: &Path,
    max_bytes: u64,
) -> Result<EphemeralArchive, ArchiveError> {
    fs::create_dir_all(scratch_root)?;
    let dir = scratch_root.join(format!("{}{}", SCRATCH_PREFIX, Uuid::new_v4().simple()));
    fs::create_dir(&dir)?;

    let file_name = archive_file_name(source);
    let zip_path = dir.join(&file_name);
    match build(source, &zip_path, max_bytes) {
        Ok(summary) => {
            tracing::info!(
                files = summary.files,
                bytes = summary.bytes,
                "built download archive {}",
                file_name
            );
            Ok(EphemeralArchive {
                dir,
                zip_path,
                file_name,
            })
        }
        Err(e) => {
            let _ = fs::remove_dir_all(&dir);
            Err(e)
        }
    }
}

/// Build a share artifact inside `artifact_dir`, which must not exist yet.
///
/// The directory belongs to a single share token; deleting it removes the
/// artifact and nothing else.
pub fn build_share_artifact(
    source: &Path,
    artifact_dir: &Path,
    max_bytes: u64,
) -> Result<PathBuf, ArchiveError> {
    fs::create_dir(artifact_dir)?;
    let zip_path = artifact_dir.join(archive_file_name(source));
    match build(source, &zip_path, max_bytes) {
        Ok(summary) => {
            tracing::info!(
                files = summary.files,
                bytes = summary.bytes,
                "built share artifact"
            );
            Ok(zip_path)
        }
        Err(e) => {
            let _ = fs::remove_dir_all(artifact_dir);
            Err(e)
        }
    }
}

/// `<folder>.zip`, or `archive.zip` when the folder has no usable name.
pub fn archive_file_name(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.is_empty() {
        "archive.zip".to_string()
    } else {
        format!("{}.zip", name)
    }
}

/// Remove download directories left behind by a previous run.
pub fn purge_scratch(scratch_root: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(scratch_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_scratch = entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX);
        if is_scratch && entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn write_archive(source: &Path, destination: &Path) -> Result<ArchiveSummary, ArchiveError> {
    let file = File::create(destination)?;
    // The archive may sit inside the tree it is reading
    let own_path = fs::canonicalize(destination)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = ArchiveSummary::default();

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || is_same_file(entry.path(), &own_path) {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let len = entry.metadata()?.len();
        zip.start_file(name, options.large_file(len >= ZIP64_THRESHOLD))?;
        let mut input = File::open(entry.path())?;
        summary.bytes += io::copy(&mut input, &mut zip)?;
        summary.files += 1;
    }

    let file = zip.finish()?;
    file.sync_all()?;
    Ok(summary)
}

fn is_same_file(path: &Path, canonical: &Path) -> bool {
    path.file_name() == canonical.file_name()
        && fs::canonicalize(path).map(|p| p == canonical).unwrap_or(false)
}
