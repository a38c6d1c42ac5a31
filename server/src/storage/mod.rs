pub mod archive;
pub mod cleanup;
pub mod error;
pub mod fileops;
pub mod naming;
pub mod path_guard;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

pub use archive::{ArchiveError, EphemeralArchive};
pub use cleanup::{CleanupGuard, CleanupScheduler, CleanupTicket};
pub use error::FsError;
pub use fileops::{BatchReport, Download, FileOps, Listing, Preview, PreviewKind, UploadItem};
pub use naming::{EntryKind, EntryName, SuffixPolicy};
pub use path_guard::{EntryPath, PathGuard, ResolvedPath};

/// Replace `path` with `content` via a sibling temp file and a rename, so
/// readers see either the old or the new bytes, never a mix.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    tracing::debug!("Wrote {} ({} bytes)", path.display(), content.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state/shares.json");

        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":1}");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
