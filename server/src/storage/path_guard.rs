//! Root containment for user-supplied paths.
//!
//! Every path that reaches a filesystem mutation is produced here. A
//! [`ResolvedPath`] only exists once its canonical form has been checked to sit
//! at or below the root, component by component.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::error::FsError;
use super::naming::EntryName;

/// Resolves relative paths against a single canonical root directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

/// An absolute, canonical path known to be equal to or nested under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    absolute: PathBuf,
    relative: PathBuf,
}

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.absolute
    }

    /// Path relative to the root, empty for the root itself.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Relative path with `/` separators, as shown to clients.
    pub fn display_relative(&self) -> String {
        join_components(&self.relative)
    }

    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.absolute.file_name()
    }

    /// Path of a new entry directly inside this directory.
    ///
    /// `EntryName` never contains separators or `..`, so the result stays
    /// under the root as long as the entry is created rather than followed.
    pub fn child(&self, name: &EntryName) -> PathBuf {
        self.absolute.join(name.as_str())
    }
}

/// An existing entry addressed by its own name inside a resolved parent.
///
/// The parent is canonical and contained; the final component is not
/// followed, so a symlink entry is the link itself, never its target.
#[derive(Debug, Clone)]
pub struct EntryPath {
    parent: ResolvedPath,
    name: EntryName,
    path: PathBuf,
}

impl EntryPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn parent(&self) -> &ResolvedPath {
        &self.parent
    }

    pub fn name(&self) -> &EntryName {
        &self.name
    }

    pub fn display_relative(&self) -> String {
        if self.parent.is_root() {
            self.name.to_string()
        } else {
            format!("{}/{}", self.parent.display_relative(), self.name)
        }
    }

    /// `symlink_metadata` of the entry itself.
    pub fn metadata(&self) -> io::Result<fs::Metadata> {
        fs::symlink_metadata(&self.path)
    }
}

impl PathGuard {
    /// Create a guard for `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root is not a directory: {}", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `relative` against the root.
    ///
    /// Rejects `..`, absolute components, NUL bytes and backslashes outright,
    /// then canonicalizes and rejects anything whose canonical form is not
    /// under the root (symlink escape). A dangling symlink is a rejection,
    /// never a fallback to the unresolved path.
    pub fn resolve(&self, relative: &str) -> Result<ResolvedPath, FsError> {
        let cleaned = normalize_relative(relative).map_err(|e| {
            tracing::warn!(input = %relative, "rejected path: {}", e);
            e
        })?;

        let joined = self.root.join(&cleaned);
        let canonical = match fs::canonicalize(&joined) {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A link that exists but points nowhere is a violation, not a miss
                if fs::symlink_metadata(&joined).is_ok() {
                    tracing::warn!(input = %relative, "rejected dangling symlink");
                    return Err(FsError::PathViolation(relative.to_string()));
                }
                return Err(FsError::NotFound(relative.to_string()));
            }
            Err(e) => {
                tracing::warn!(input = %relative, "canonicalize failed: {}", e);
                return Err(FsError::PathViolation(relative.to_string()));
            }
        };

        // Path::starts_with compares whole components, so /home2 is not under /home
        let relative_part = match canonical.strip_prefix(&self.root) {
            Ok(rest) => rest.to_path_buf(),
            Err(_) => {
                tracing::warn!(input = %relative, "rejected path outside root");
                return Err(FsError::PathViolation(relative.to_string()));
            }
        };

        Ok(ResolvedPath {
            absolute: canonical,
            relative: relative_part,
        })
    }

    /// Resolve `relative` as an entry to mutate: the parent goes through
    /// [`PathGuard::resolve`], the last component is taken literally.
    ///
    /// The root itself is not an entry.
    pub fn resolve_entry(&self, relative: &str) -> Result<EntryPath, FsError> {
        let cleaned = normalize_relative(relative).map_err(|e| {
            tracing::warn!(input = %relative, "rejected path: {}", e);
            e
        })?;
        let name = match cleaned.file_name() {
            Some(name) => EntryName::from_component(&name.to_string_lossy())?,
            None => return Err(FsError::InvalidTarget("the root directory".into())),
        };
        let parent_relative = cleaned.parent().map(join_components).unwrap_or_default();
        let parent = self.resolve(&parent_relative)?;

        let path = parent.child(&name);
        if fs::symlink_metadata(&path).is_err() {
            return Err(FsError::NotFound(relative.to_string()));
        }
        Ok(EntryPath { parent, name, path })
    }

    /// Whether `path` (canonicalized) is the root or lies below it.
    pub fn contains(&self, path: &Path) -> bool {
        fs::canonicalize(path)
            .map(|canonical| canonical.starts_with(&self.root))
            .unwrap_or(false)
    }

    /// Relative `/`-separated form of an absolute path under the root.
    pub fn display_relative(&self, absolute: &Path) -> Option<String> {
        absolute
            .strip_prefix(&self.root)
            .ok()
            .map(join_components)
    }
}

/// Validate a relative path component-wise without touching the filesystem.
///
/// Empty input and `.` components are allowed and mean "the root".
pub fn normalize_relative(relative: &str) -> Result<PathBuf, FsError> {
    if relative.contains('\0') {
        return Err(FsError::PathViolation("path contains a null byte".into()));
    }
    if relative.contains('\\') {
        return Err(FsError::PathViolation(relative.to_string()));
    }

    let mut cleaned = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FsError::PathViolation(relative.to_string()));
            }
        }
    }
    Ok(cleaned)
}

fn join_components(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn guard_with_tree() -> (tempfile::TempDir, PathGuard) {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("docs/nested")).unwrap();
        fs::write(temp.path().join("docs/readme.txt"), b"hi").unwrap();
        let guard = PathGuard::new(temp.path()).unwrap();
        (temp, guard)
    }

    #[test]
    fn test_resolves_paths_inside_root() {
        let (_temp, guard) = guard_with_tree();

        let resolved = guard.resolve("docs/readme.txt").unwrap();
        assert!(resolved.as_path().starts_with(guard.root()));
        assert_eq!(resolved.display_relative(), "docs/readme.txt");

        let nested = guard.resolve("./docs//nested/").unwrap();
        assert_eq!(nested.relative(), Path::new("docs/nested"));
    }

    #[test]
    fn test_empty_path_is_root() {
        let (_temp, guard) = guard_with_tree();
        let resolved = guard.resolve("").unwrap();
        assert!(resolved.is_root());
        assert_eq!(resolved.as_path(), guard.root());
    }

    #[test]
    fn test_rejects_traversal() {
        let (_temp, guard) = guard_with_tree();
        for input in ["..", "../etc/passwd", "docs/../../etc", "docs/..", "docs/nested/../.."] {
            assert!(
                matches!(guard.resolve(input), Err(FsError::PathViolation(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_absolute_and_odd_input() {
        let (_temp, guard) = guard_with_tree();
        assert!(matches!(guard.resolve("/etc/passwd"), Err(FsError::PathViolation(_))));
        assert!(matches!(guard.resolve("/docs"), Err(FsError::PathViolation(_))));
        assert!(matches!(guard.resolve("docs\\..\\x"), Err(FsError::PathViolation(_))));
        assert!(matches!(guard.resolve("docs\0"), Err(FsError::PathViolation(_))));
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let (_temp, guard) = guard_with_tree();
        assert!(matches!(guard.resolve("docs/missing.txt"), Err(FsError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escape() {
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let (temp, guard) = guard_with_tree();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        assert!(matches!(guard.resolve("escape"), Err(FsError::PathViolation(_))));
        assert!(matches!(
            guard.resolve("escape/secret.txt"),
            Err(FsError::PathViolation(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_dangling_symlink() {
        let (temp, guard) = guard_with_tree();
        std::os::unix::fs::symlink(temp.path().join("nowhere"), temp.path().join("dangling"))
            .unwrap();
        assert!(matches!(guard.resolve("dangling"), Err(FsError::PathViolation(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_within_root_is_allowed() {
        let (temp, guard) = guard_with_tree();
        std::os::unix::fs::symlink(temp.path().join("docs"), temp.path().join("alias")).unwrap();
        let resolved = guard.resolve("alias/readme.txt").unwrap();
        assert_eq!(resolved.display_relative(), "docs/readme.txt");
    }

    #[cfg(unix)]
    #[test]
    fn test_entry_resolution_keeps_the_link() {
        let (temp, guard) = guard_with_tree();
        std::os::unix::fs::symlink(temp.path().join("docs"), temp.path().join("alias")).unwrap();

        let entry = guard.resolve_entry("alias").unwrap();
        assert_eq!(entry.as_path(), guard.root().join("alias"));
        assert!(entry.metadata().unwrap().file_type().is_symlink());
        assert_eq!(entry.display_relative(), "alias");

        // A link pointing nowhere is still an entry that can be removed
        std::os::unix::fs::symlink(temp.path().join("nowhere"), temp.path().join("dangling"))
            .unwrap();
        assert!(guard.resolve_entry("dangling").is_ok());

        // Parents are still resolved and contained
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();
        fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        assert!(matches!(
            guard.resolve_entry("escape/secret.txt"),
            Err(FsError::PathViolation(_))
        ));
    }

    #[test]
    fn test_entry_resolution_edges() {
        let (_temp, guard) = guard_with_tree();
        assert_eq!(
            guard.resolve_entry("docs/readme.txt").unwrap().display_relative(),
            "docs/readme.txt"
        );
        assert!(matches!(guard.resolve_entry(""), Err(FsError::InvalidTarget(_))));
        assert!(matches!(guard.resolve_entry("."), Err(FsError::InvalidTarget(_))));
        assert!(matches!(guard.resolve_entry("../x"), Err(FsError::PathViolation(_))));
        assert!(matches!(guard.resolve_entry("docs/none"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_contains() {
        let (temp, guard) = guard_with_tree();
        assert!(guard.contains(&temp.path().join("docs/nested")));
        assert!(guard.contains(temp.path()));

        let elsewhere = tempdir().unwrap();
        assert!(!guard.contains(elsewhere.path()));
        assert!(!guard.contains(&temp.path().join("missing")));
    }

    #[test]
    fn test_sibling_with_common_prefix_is_outside() {
        let parent = tempdir().unwrap();
        fs::create_dir(parent.path().join("home")).unwrap();
        fs::create_dir(parent.path().join("home2")).unwrap();
        let guard = PathGuard::new(parent.path().join("home")).unwrap();

        let sibling = fs::canonicalize(parent.path().join("home2")).unwrap();
        assert!(guard.display_relative(&sibling).is_none());
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_relative("a/./b").unwrap(), PathBuf::from("a/b"));
        assert_eq!(normalize_relative("").unwrap(), PathBuf::new());
        assert!(normalize_relative("a/../b").is_err());
    }
}
