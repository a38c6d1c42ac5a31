//! Collision-free naming for new entries.
//!
//! Candidates follow `"{stem} ({n}){ext}"`. Files restart numbering at 1
//! even when the desired name already ends in ` (N)`; folders resume from
//! `N + 1`. The `create_*` and `reserve` helpers claim the name with an
//! exclusive create and move on to the next candidate when it is taken, so
//! two concurrent writers can never end up with the same name.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::error::FsError;

/// Upper bound on candidates tried before giving up.
const MAX_CANDIDATES: u64 = 10_000;

/// A bare entry name: no separators, not `.` or `..`, not empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName(String);

impl EntryName {
    /// Sanitize user input down to a bare file name.
    ///
    /// Anything up to the last `/` or `\` is dropped, matching what a browser
    /// sends for `C:\Users\me\report.txt`.
    pub fn parse(raw: &str) -> Result<Self, FsError> {
        let trimmed = raw.trim();
        let bare = trimmed
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or_default()
            .trim();

        if bare.is_empty() || bare == "." || bare == ".." || bare.contains('\0') {
            return Err(FsError::InvalidName(raw.to_string()));
        }
        Ok(Self(bare.to_string()))
    }

    /// Accept a single path component exactly as given, without trimming.
    ///
    /// Used for names that already exist on disk, where `parse` could map
    /// `" a.txt"` onto a different entry.
    pub fn from_component(raw: &str) -> Result<Self, FsError> {
        let bad = raw.is_empty()
            || raw == "."
            || raw == ".."
            || raw.contains(['/', '\\', '\0']);
        if bad {
            return Err(FsError::InvalidName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// How numbering continues when the desired name already ends in ` (N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixPolicy {
    /// Always start at ` (1)`: `a (1).txt` becomes `a (1) (1).txt`.
    Restart,
    /// Continue from `N + 1`: `Photos (2)` becomes `Photos (3)`.
    Resume,
}

impl EntryKind {
    /// Default policy for the kind: files restart, folders resume.
    pub fn policy(self) -> SuffixPolicy {
        match self {
            EntryKind::File => SuffixPolicy::Restart,
            EntryKind::Folder => SuffixPolicy::Resume,
        }
    }
}

/// Split a name into stem and extension.
///
/// Folders have no extension. For files the extension is the last `.` and
/// what follows it, unless the dot only starts the name (`.bashrc`).
pub fn split_name(name: &str, kind: EntryKind) -> (&str, &str) {
    if kind == EntryKind::Folder {
        return (name, "");
    }
    match name.rfind('.') {
        Some(idx) if !name[..idx].chars().all(|c| c == '.') => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Strip a trailing ` (N)` from a stem, returning the base and `N`.
fn numbered_suffix(stem: &str) -> Option<(&str, u64)> {
    let inner = stem.strip_suffix(')')?;
    let open = inner.rfind(" (")?;
    let digits = &inner[open + 2..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n = digits.parse().ok()?;
    Some((&stem[..open], n))
}

/// Candidate names in the order they are tried, starting with the desired name itself.
pub fn candidate_names(
    desired: &str,
    kind: EntryKind,
    policy: SuffixPolicy,
) -> impl Iterator<Item = String> {
    let (stem, ext) = split_name(desired, kind);
    let (base, start) = match (policy, numbered_suffix(stem)) {
        (SuffixPolicy::Resume, Some((base, n))) => (base.to_string(), n.saturating_add(1)),
        _ => (stem.to_string(), 1u64),
    };
    let ext = ext.to_string();
    let first = desired.to_string();

    std::iter::once(first).chain(
        (start..start.saturating_add(MAX_CANDIDATES))
            .map(move |n| format!("{} ({}){}", base, n, ext)),
    )
}

fn entry_exists(path: &Path) -> bool {
    // symlink_metadata so a dangling link still counts as taken
    fs::symlink_metadata(path).is_ok()
}

/// First candidate not present in `dir` at the time of the check.
///
/// Advisory only under concurrent mutation; prefer the `create_*` helpers
/// when the name is about to be used.
pub fn uniquify(dir: &Path, desired: &EntryName, kind: EntryKind) -> Result<String, FsError> {
    candidate_names(desired.as_str(), kind, kind.policy())
        .find(|candidate| !entry_exists(&dir.join(candidate)))
        .ok_or_else(|| FsError::NameConflict(desired.to_string()))
}

/// Claim a unique name for `kind` in `dir` and return its path.
///
/// Files are claimed with `create_new`, folders with `create_dir`; an
/// `AlreadyExists` error advances to the next candidate.
pub fn reserve(dir: &Path, desired: &EntryName, kind: EntryKind) -> Result<PathBuf, FsError> {
    match kind {
        EntryKind::File => create_unique_file(dir, desired).map(|(path, _)| path),
        EntryKind::Folder => create_unique_dir(dir, desired, kind.policy()),
    }
}

/// Create a new empty file under a unique name and return it open for writing.
pub fn create_unique_file(dir: &Path, desired: &EntryName) -> Result<(PathBuf, File), FsError> {
    for candidate in candidate_names(desired.as_str(), EntryKind::File, SuffixPolicy::Restart) {
        let path = dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FsError::NameConflict(desired.to_string()))
}

/// Create a new directory under a unique name.
pub fn create_unique_dir(
    dir: &Path,
    desired: &EntryName,
    policy: SuffixPolicy,
) -> Result<PathBuf, FsError> {
    for candidate in candidate_names(desired.as_str(), EntryKind::Folder, policy) {
        let path = dir.join(&candidate);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(FsError::NameConflict(desired.to_string()))
}
