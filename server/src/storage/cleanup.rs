//! Deferred deletion of ephemeral download directories.
//!
//! Each scheduled directory gets a ticket. The ticket is removed either when
//! the response body holding its [`CleanupGuard`] is dropped, or when the
//! deadline timer fires, whichever happens first. Running it twice is a no-op.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    deadline: Duration,
}

#[derive(Debug)]
struct TicketInner {
    path: PathBuf,
    done: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to one pending deletion.
#[derive(Debug, Clone)]
pub struct CleanupTicket(Arc<TicketInner>);

/// Deletes the ticket's directory when dropped.
#[derive(Debug)]
pub struct CleanupGuard(CleanupTicket);

impl CleanupScheduler {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    /// Schedule `path` for deletion after the deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, path: PathBuf) -> CleanupTicket {
        let ticket = CleanupTicket(Arc::new(TicketInner {
            path,
            done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }));

        let timer = ticket.clone();
        let deadline = self.deadline;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.0.cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    tracing::debug!("cleanup deadline reached for {}", timer.path().display());
                    let _ = tokio::task::spawn_blocking(move || timer.run_now()).await;
                }
            }
        });

        ticket
    }
}

impl CleanupTicket {
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    pub fn is_done(&self) -> bool {
        self.0.done.load(Ordering::SeqCst)
    }

    /// Delete the directory now and stop the timer.
    ///
    /// Only the first call touches the filesystem; later calls return `Ok`.
    pub fn run_now(&self) -> io::Result<()> {
        if self.0.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.0.cancel.cancel();

        match fs::remove_dir_all(&self.0.path) {
            Ok(()) => {
                tracing::debug!("removed {}", self.0.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::warn!("failed to remove {}: {}", self.0.path.display(), e);
                Err(e)
            }
        }
    }

    /// Stop the timer without deleting anything.
    pub fn cancel(&self) {
        self.0.done.store(true, Ordering::SeqCst);
        self.0.cancel.cancel();
    }

    pub fn into_guard(self) -> CleanupGuard {
        CleanupGuard(self)
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let _ = self.0.run_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn scratch_dir(parent: &Path) -> PathBuf {
        let dir = parent.join("dl-test");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.zip"), b"zip").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_run_now_is_idempotent() {
        let temp = tempdir().unwrap();
        let dir = scratch_dir(temp.path());

        let ticket = CleanupScheduler::new(Duration::from_secs(3600)).schedule(dir.clone());
        ticket.run_now().unwrap();
        assert!(!dir.exists());
        assert!(ticket.is_done());

        // Recreate the path: a second run must not touch it
        fs::create_dir(&dir).unwrap();
        ticket.run_now().unwrap();
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn test_guard_drop_deletes() {
        let temp = tempdir().unwrap();
        let dir = scratch_dir(temp.path());

        let ticket = CleanupScheduler::new(Duration::from_secs(3600)).schedule(dir.clone());
        let guard = ticket.clone().into_guard();
        drop(guard);

        assert!(!dir.exists());
        assert!(ticket.is_done());
    }

    #[tokio::test]
    async fn test_deadline_deletes_unfinished_download() {
        let temp = tempdir().unwrap();
        let dir = scratch_dir(temp.path());

        let ticket = CleanupScheduler::new(Duration::from_millis(20)).schedule(dir.clone());
        for _ in 0..100 {
            if ticket.is_done() && !dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_fine() {
        let temp = tempdir().unwrap();
        let ticket =
            CleanupScheduler::new(Duration::from_secs(3600)).schedule(temp.path().join("gone"));
        assert!(ticket.run_now().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_keeps_directory() {
        let temp = tempdir().unwrap();
        let dir = scratch_dir(temp.path());

        let ticket = CleanupScheduler::new(Duration::from_millis(10)).schedule(dir.clone());
        ticket.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(dir.exists());
        ticket.run_now().unwrap();
        assert!(dir.exists());
    }
}
