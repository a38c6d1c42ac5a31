pub mod rest;

use crate::config::Config;
use crate::db::{ShareStore, UserStore};
use crate::storage::{CleanupScheduler, FileOps};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub files: Arc<FileOps>,
    pub shares: Arc<ShareStore>,
    pub users: Arc<UserStore>,
    /// Deletes ephemeral download archives after their response
    pub cleanup: CleanupScheduler,
}

impl AppState {
    pub fn new(
        config: Config,
        files: FileOps,
        shares: Arc<ShareStore>,
        users: Arc<UserStore>,
    ) -> Self {
        let cleanup = CleanupScheduler::new(Duration::from_secs(config.download_cleanup_secs));
        Self {
            config,
            files: Arc::new(files),
            shares,
            users,
            cleanup,
        }
    }
}
