// Local crates
use crate::metrics::metrics::REAPED_FILES_TOTAL;
use crate::pattern::pattern::PatternRegistry;
use crate::position::position::{PositionStore, TrackedFile};

// External crates
use anyhow::{Context, Result};
use chrono::Local;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A file must have been quiet this long before it may be deleted.
const REAP_GRACE: Duration = Duration::from_secs(30);

/// Deletes rotated files once they are fully shipped: the filename no longer
/// names the current time bucket, the inode is unchanged, every byte is
/// acknowledged and the file has been quiet past the grace period.
///
/// The reaper never touches the position table itself; the delete produces a
/// filesystem remove event and the watcher drops the entry through the
/// normal path.
#[derive(Debug)]
pub struct Reaper {
    store: Arc<PositionStore>,
    registry: Arc<PatternRegistry>,
    post_delete_command: Option<String>,
    grace: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<PositionStore>,
        registry: Arc<PatternRegistry>,
        post_delete_command: Option<String>,
    ) -> Self {
        Self {
            store,
            registry,
            post_delete_command,
            grace: REAP_GRACE,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Periodic loop, one sweep per minute until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Reaper received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Examine every tracked file and delete the ones that qualify.
    #[instrument(
        name = "reaper::sweep",
        target = "reaper::reaper",
        skip_all,
        level = "debug"
    )]
    pub async fn sweep(&self) {
        for tracked in self.store.snapshot() {
            match self.try_reap(&tracked).await {
                Ok(true) => {
                    REAPED_FILES_TOTAL.inc();
                    if let Some(cmd) = &self.post_delete_command {
                        run_post_delete(cmd).await;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        path = %tracked.path.display(),
                        error = %e,
                        "Failed to reap file"
                    );
                }
            }
        }
    }

    /// All four conditions must hold: rotated out of the current bucket,
    /// same inode as when tracking started, size equal to the committed
    /// offset, and quiet past the grace period.
    async fn try_reap(&self, tracked: &TrackedFile) -> Result<bool> {
        let Some(dir) = tracked.path.parent() else {
            return Ok(false);
        };
        let Some(name) = tracked.path.file_name().and_then(|s| s.to_str()) else {
            return Ok(false);
        };
        let Some(entry) = self.registry.entry_for(dir, &tracked.topic, &tracked.pattern) else {
            // The spec this record came from is no longer configured.
            return Ok(false);
        };

        if name == entry.expected_name(&Local::now()) {
            // Still the bucket currently being written.
            return Ok(false);
        }

        let metadata = match tokio::fs::metadata(&tracked.path).await {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        if metadata.ino() != tracked.inode {
            debug!(path = %tracked.path.display(), "Inode changed, not reaping");
            return Ok(false);
        }
        if metadata.len() != tracked.offset {
            debug!(
                path = %tracked.path.display(),
                size = metadata.len(),
                committed = tracked.offset,
                "Not fully shipped yet, not reaping"
            );
            return Ok(false);
        }

        let mtime = metadata
            .modified()
            .context("filesystem does not report mtime")?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default();
        if age < self.grace {
            return Ok(false);
        }

        tokio::fs::remove_file(&tracked.path)
            .await
            .with_context(|| format!("failed to delete {}", tracked.path.display()))?;
        info!(
            path = %tracked.path.display(),
            offset = tracked.offset,
            "Reaped fully shipped rotated file"
        );
        Ok(true)
    }
}

/// Run the configured post-delete command in a subshell, capturing its
/// output. Failure is logged with the captured output and never fatal.
async fn run_post_delete(command: &str) {
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            debug!(command, "Post-delete command succeeded");
        }
        Ok(output) => {
            error!(
                command,
                status = %output.status,
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Post-delete command failed"
            );
        }
        Err(e) => {
            error!(command, error = %e, "Failed to execute post-delete command");
        }
    }
}
