//! JSON snapshot stores kept under the data directory.
//!
//! Each store holds its whole state in memory behind an `Arc` that is swapped
//! after every successful persist. Mutations serialize on a writer mutex that
//! spans read, modify and persist; readers only clone the current `Arc`.

pub mod shares;
pub mod users;

use std::fs;
use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::write_atomic;

pub use shares::{ShareError, ShareRecord, ShareStore, SweepReport};
pub use users::{User, UserError, UserStore, UserUpdate};

/// Load a snapshot, falling back to the default when the file is missing.
///
/// A file that exists but cannot be parsed is logged and treated as empty.
pub fn load_snapshot<T>(path: &Path, what: &str) -> io::Result<T>
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e),
    };

    match serde_json::from_slice(&raw) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!(
                "{} snapshot at {} is corrupt, starting empty: {}",
                what,
                path.display(),
                e
            );
            Ok(T::default())
        }
    }
}

pub fn persist_snapshot<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &bytes)
}
