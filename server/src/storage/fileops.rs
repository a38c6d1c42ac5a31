//! File operations under the root directory.
//!
//! Every operation resolves its inputs through [`PathGuard`] first and claims
//! new names through the exclusive-create helpers in [`naming`]. Operations
//! are synchronous; the HTTP layer runs them on the blocking pool.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use super::archive::{self, EphemeralArchive};
use super::error::FsError;
use super::naming::{self, EntryKind, EntryName, SuffixPolicy};
use super::path_guard::{normalize_relative, EntryPath, PathGuard, ResolvedPath};
use super::write_atomic;

#[derive(Debug)]
pub struct FileOps {
    guard: PathGuard,
    scratch_dir: PathBuf,
    max_archive_bytes: u64,
}

/// Immediate children of a directory, each list sorted case-insensitively.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct Listing {
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

/// One incoming file. For folder uploads `name` is the path relative to the
/// uploaded folder's parent, e.g. `Photos/2024/a.jpg`.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub name: String,
    pub data: Vec<u8>,
}

/// Per-file outcome of an upload. The batch is never rolled back.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<String>,
}

/// Largest text file decoded for preview.
const MAX_PREVIEW_BYTES: u64 = 5 * 1024 * 1024;

/// How the viewer should present a file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Image,
    Text,
    Audio,
    Video,
    Spreadsheet,
    Presentation,
    Archive,
    Unsupported,
}

impl PreviewKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tiff" | "webp" => PreviewKind::Image,
            "txt" | "md" | "py" | "json" | "html" | "css" | "js" | "csv" | "xml" | "yml"
            | "yaml" | "ini" | "log" | "bat" => PreviewKind::Text,
            "mp3" | "wav" | "ogg" | "aac" | "flac" | "m4a" => PreviewKind::Audio,
            "mp4" | "webm" | "mov" | "avi" | "mkv" | "flv" | "wmv" => PreviewKind::Video,
            "xls" | "xlsx" | "ods" => PreviewKind::Spreadsheet,
            "ppt" | "pptx" | "odp" => PreviewKind::Presentation,
            "zip" | "rar" | "tar" | "gz" | "7z" => PreviewKind::Archive,
            _ => PreviewKind::Unsupported,
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Preview {
    pub kind: PreviewKind,
    /// Decoded text, only for `Text`
    pub content: Option<String>,
}

#[derive(Debug)]
pub enum Download {
    File { path: PathBuf, name: String },
    Archive(EphemeralArchive),
}

impl FileOps {
    pub fn new(guard: PathGuard, scratch_dir: PathBuf, max_archive_bytes: u64) -> Self {
        Self {
            guard,
            scratch_dir,
            max_archive_bytes,
        }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn resolve(&self, relative: &str) -> Result<ResolvedPath, FsError> {
        self.guard.resolve(relative)
    }

    pub fn max_archive_bytes(&self) -> u64 {
        self.max_archive_bytes
    }

    fn resolve_dir(&self, relative: &str) -> Result<ResolvedPath, FsError> {
        let resolved = self.guard.resolve(relative)?;
        if !resolved.as_path().is_dir() {
            return Err(FsError::InvalidTarget(format!("not a directory: {}", relative)));
        }
        Ok(resolved)
    }

    fn resolve_entry(&self, relative: &str) -> Result<EntryPath, FsError> {
        self.guard.resolve_entry(relative)
    }

    pub fn list(&self, relative: &str) -> Result<Listing, FsError> {
        let dir = self.resolve_dir(relative)?;
        let mut listing = Listing::default();

        for entry in fs::read_dir(dir.as_path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Follows symlinks; entries whose target is gone are skipped
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => listing.directories.push(name),
                Ok(_) => listing.files.push(name),
                Err(_) => continue,
            }
        }

        sort_names(&mut listing.directories);
        sort_names(&mut listing.files);
        Ok(listing)
    }

    /// Save each item into `destination` under a collision-free name.
    ///
    /// Items with an empty name are skipped. A failed item is recorded and
    /// the rest of the batch continues.
    pub fn upload(&self, destination: &str, items: Vec<UploadItem>) -> Result<BatchReport, FsError> {
        let dest = self.resolve_dir(destination)?;
        let mut report = BatchReport::default();

        for item in items {
            if item.name.trim().is_empty() {
                continue;
            }
            let result = EntryName::parse(&item.name)
                .and_then(|name| write_new_file(dest.as_path(), &name, &item.data));
            match result {
                Ok(path) => report.saved.push(path),
                Err(e) => {
                    tracing::warn!("upload of {} failed: {}", item.name, e);
                    report.failed.push(item.name);
                }
            }
        }

        tracing::info!(
            saved = report.saved.len(),
            failed = report.failed.len(),
            "upload into /{}",
            dest.display_relative()
        );
        Ok(report)
    }

    /// Recreate an uploaded folder tree inside `destination`.
    ///
    /// The top-level folder name is made unique with the resume policy, so
    /// uploading `Photos (2)` next to an existing one yields `Photos (3)`.
    /// Items must all live under the same top-level folder.
    pub fn upload_folder(
        &self,
        destination: &str,
        items: Vec<UploadItem>,
    ) -> Result<BatchReport, FsError> {
        let dest = self.resolve_dir(destination)?;
        let mut report = BatchReport::default();
        let mut top: Option<(String, PathBuf)> = None;

        for item in items {
            if item.name.trim().is_empty() {
                continue;
            }

            let parts = match folder_item_parts(&item.name) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::warn!("rejected folder upload entry {}: {}", item.name, e);
                    report.failed.push(item.name);
                    continue;
                }
            };

            if top.is_none() {
                let created = naming::create_unique_dir(
                    dest.as_path(),
                    &EntryName::parse(&parts.top)?,
                    SuffixPolicy::Resume,
                )?;
                top = Some((parts.top.clone(), created));
            }
            let folder = match &top {
                Some((name, folder)) if *name == parts.top => folder.clone(),
                _ => {
                    report.failed.push(item.name);
                    continue;
                }
            };

            match write_nested_file(&folder, &parts.inner, &item.data) {
                Ok(path) => report.saved.push(path),
                Err(e) => {
                    tracing::warn!("folder upload of {} failed: {}", item.name, e);
                    report.failed.push(item.name);
                }
            }
        }

        if let Some((_, folder)) = &top {
            tracing::info!(
                saved = report.saved.len(),
                failed = report.failed.len(),
                "folder upload into {}",
                self.guard.display_relative(folder).unwrap_or_default()
            );
        }
        Ok(report)
    }

    /// Move `source` into the directory `destination`, renaming on collision.
    ///
    /// Moving an entry into the directory it already lives in returns its
    /// current path unchanged.
    pub fn move_entry(&self, source: &str, destination: &str) -> Result<PathBuf, FsError> {
        let src = self.resolve_entry(source)?;
        let dest = self.resolve_dir(destination)?;

        if dest.as_path().starts_with(src.as_path()) {
            return Err(FsError::InvalidTarget(format!(
                "cannot move {} into itself",
                source
            )));
        }
        if src.parent().as_path() == dest.as_path() {
            return Ok(src.as_path().to_path_buf());
        }

        let kind = kind_of(&src)?;

        // Claim the final name first, then rename over the placeholder
        let target = naming::reserve(dest.as_path(), src.name(), kind)?;
        if let Err(e) = fs::rename(src.as_path(), &target) {
            remove_placeholder(&target, kind);
            return Err(e.into());
        }

        tracing::info!(
            "moved /{} to /{}",
            src.display_relative(),
            self.guard.display_relative(&target).unwrap_or_default()
        );
        Ok(target)
    }

    /// Rename an entry in place. Fails with `NameConflict` if `new_name` is taken.
    pub fn rename(&self, path: &str, new_name: &str) -> Result<PathBuf, FsError> {
        let src = self.resolve_entry(path)?;
        let name = EntryName::parse(new_name)?;
        let target = src.parent().child(&name);

        if target == src.as_path() {
            return Ok(target);
        }

        let kind = kind_of(&src)?;
        let claimed = match kind {
            EntryKind::Folder => fs::create_dir(&target),
            EntryKind::File => OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .map(|_| ()),
        };
        match claimed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(FsError::NameConflict(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = fs::rename(src.as_path(), &target) {
            remove_placeholder(&target, kind);
            return Err(e.into());
        }

        tracing::info!("renamed /{} to {}", src.display_relative(), name);
        Ok(target)
    }

    /// Remove a file, or a directory and everything below it. A symlink is
    /// unlinked; its target is left alone.
    pub fn delete(&self, path: &str) -> Result<(), FsError> {
        let target = self.resolve_entry(path)?;
        if target.metadata()?.is_dir() {
            fs::remove_dir_all(target.as_path())?;
        } else {
            fs::remove_file(target.as_path())?;
        }
        tracing::info!("deleted /{}", target.display_relative());
        Ok(())
    }

    /// Create `name` inside `parent`. An existing entry is reported, not reused.
    pub fn create_folder(&self, parent: &str, name: &str) -> Result<PathBuf, FsError> {
        let dir = self.resolve_dir(parent)?;
        let name = EntryName::parse(name)?;
        let path = dir.child(&name);

        match fs::create_dir(&path) {
            Ok(()) => {
                tracing::info!("created folder {} in /{}", name, dir.display_relative());
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(FsError::AlreadyExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the content of an existing regular file.
    ///
    /// Line endings are normalized to `\n` and a non-empty text always ends
    /// with one, matching what the editor shows.
    pub fn save_content(&self, path: &str, content: &str) -> Result<(), FsError> {
        let target = self.guard.resolve(path)?;
        if target.is_root() || !target.as_path().is_file() {
            return Err(FsError::InvalidTarget(format!("not a file: {}", path)));
        }
        let text = normalize_line_endings(content);
        write_atomic(target.as_path(), text.as_bytes())?;
        tracing::info!(bytes = text.len(), "saved /{}", target.display_relative());
        Ok(())
    }

    /// Classify a file for the viewer and decode its text when it is text.
    pub fn preview(&self, path: &str) -> Result<Preview, FsError> {
        let target = self.guard.resolve(path)?;
        if !target.as_path().is_file() {
            return Err(FsError::InvalidTarget(format!("not a file: {}", path)));
        }

        let kind = PreviewKind::from_path(target.as_path());
        if kind != PreviewKind::Text {
            return Ok(Preview { kind, content: None });
        }

        let size = fs::metadata(target.as_path())?.len();
        if size > MAX_PREVIEW_BYTES {
            return Err(FsError::InvalidTarget(format!(
                "{} is {} bytes, previews stop at {}",
                path, size, MAX_PREVIEW_BYTES
            )));
        }
        let content = decode_text(&fs::read(target.as_path())?);
        Ok(Preview { kind, content: Some(content) })
    }

    /// A file is served as-is; a directory is archived into a fresh scratch
    /// directory that the caller must schedule for deletion.
    pub fn prepare_download(&self, path: &str) -> Result<Download, FsError> {
        let target = self.guard.resolve(path)?;
        if target.as_path().is_dir() {
            let archive = archive::build_ephemeral(
                target.as_path(),
                &self.scratch_dir,
                self.max_archive_bytes,
            )?;
            return Ok(Download::Archive(archive));
        }

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        Ok(Download::File {
            path: target.as_path().to_path_buf(),
            name,
        })
    }
}

struct FolderItemParts {
    top: String,
    inner: PathBuf,
}

fn folder_item_parts(raw: &str) -> Result<FolderItemParts, FsError> {
    let relative = normalize_relative(raw)?;
    let mut components = relative.components();
    let top = match components.next() {
        Some(Component::Normal(part)) => part.to_string_lossy().to_string(),
        _ => return Err(FsError::InvalidName(raw.to_string())),
    };
    let inner = components.as_path().to_path_buf();
    if inner.as_os_str().is_empty() {
        return Err(FsError::InvalidName(raw.to_string()));
    }
    Ok(FolderItemParts { top, inner })
}

fn sort_names(names: &mut [String]) {
    names.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
}

/// Real directories are folders; files and symlinks (to anything) are files.
fn kind_of(entry: &EntryPath) -> Result<EntryKind, FsError> {
    Ok(if entry.metadata()?.is_dir() {
        EntryKind::Folder
    } else {
        EntryKind::File
    })
}

fn normalize_line_endings(content: &str) -> String {
    let mut text = content.replace("\r\n", "\n").replace('\r', "\n");
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// UTF-8 (BOM stripped), then UTF-16 when a byte-order mark says so, then
/// Latin-1, which accepts any byte sequence.
fn decode_text(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.strip_prefix('\u{feff}').unwrap_or(text).to_string();
    }

    let utf16 = match bytes {
        [0xFF, 0xFE, rest @ ..] if rest.len() % 2 == 0 => Some((rest, false)),
        [0xFE, 0xFF, rest @ ..] if rest.len() % 2 == 0 => Some((rest, true)),
        _ => None,
    };
    if let Some((rest, big_endian)) = utf16 {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| {
                if big_endian {
                    u16::from_be_bytes([pair[0], pair[1]])
                } else {
                    u16::from_le_bytes([pair[0], pair[1]])
                }
            })
            .collect();
        if let Ok(text) = String::from_utf16(&units) {
            return text;
        }
    }

    bytes.iter().map(|&b| b as char).collect()
}

fn remove_placeholder(path: &Path, kind: EntryKind) {
    let _ = match kind {
        EntryKind::Folder => fs::remove_dir(path),
        EntryKind::File => fs::remove_file(path),
    };
}

fn write_new_file(dir: &Path, name: &EntryName, data: &[u8]) -> Result<PathBuf, FsError> {
    let (path, mut file) = naming::create_unique_file(dir, name)?;
    let written = file.write_all(data).and_then(|_| file.sync_all());
    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(&path);
        return Err(e.into());
    }
    Ok(path)
}

fn write_nested_file(folder: &Path, inner: &Path, data: &[u8]) -> Result<PathBuf, FsError> {
    let name = inner
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = EntryName::parse(&name)?;

    let parent = match inner.parent() {
        Some(rel) if !rel.as_os_str().is_empty() => {
            let dir = folder.join(rel);
            fs::create_dir_all(&dir)?;
            // Refuse to follow anything that resolves outside the new folder
            let canonical_dir = fs::canonicalize(&dir)?;
            let canonical_folder = fs::canonicalize(folder)?;
            if !canonical_dir.starts_with(&canonical_folder) {
                return Err(FsError::PathViolation(inner.display().to_string()));
            }
            canonical_dir
        }
        _ => folder.to_path_buf(),
    };

    write_new_file(&parent, &name, data)
}
