use thiserror::Error;

/// Failures of filesystem operations under the root directory.
///
/// Messages carry the caller's relative input, never a resolved absolute path.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path escapes the root directory: {0}")]
    PathViolation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
    #[error("Name already taken: {0}")]
    NameConflict(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Source tree is {size} bytes, limit is {limit}")]
    CapacityExceeded { size: u64, limit: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
