// Local crates
use crate::position::position::{PositionStore, TrackedFile};
use crate::tailer::payload::Batch;
use crate::tailer::tailer::Tailer;

// External crates
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Control handle for one running tailer task.
#[derive(Debug)]
pub struct TailerHandle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

/// Owns the lifecycle of every running tailer: one task per tracked file,
/// each with its own cancellation token and wake handle. The dispatcher
/// translates filesystem activity into `start`, `stop` and `wake` calls.
#[derive(Debug)]
pub struct TailerManager {
    tailers: HashMap<PathBuf, TailerHandle>,
    store: Arc<PositionStore>,
    submit: mpsc::Sender<Batch>,
    cancel: CancellationToken,
    max_batch_lines: usize,
    max_batches: usize,
}

impl TailerManager {
    pub fn new(
        store: Arc<PositionStore>,
        submit: mpsc::Sender<Batch>,
        cancel: CancellationToken,
        max_batch_lines: usize,
        max_batches: usize,
    ) -> Self {
        Self {
            tailers: HashMap::new(),
            store,
            submit,
            cancel,
            max_batch_lines,
            max_batches,
        }
    }

    /// Spawn a tailer for a tracked file. A tailer that fails with an I/O
    /// error drops its file from the position table; the file is picked up
    /// again by a later event or startup scan.
    pub fn start(&mut self, tracked: &TrackedFile) {
        if self.tailers.contains_key(&tracked.path) {
            debug!(path = %tracked.path.display(), "Tailer already running, not starting another");
            return;
        }

        let cancel = self.cancel.child_token();
        let wake = Arc::new(Notify::new());
        let tailer = Tailer::new(
            tracked.path.clone(),
            tracked.topic.clone(),
            tracked.offset,
            self.max_batch_lines,
            self.max_batches,
            self.submit.clone(),
            Arc::clone(&wake),
            cancel.clone(),
        );

        let store = Arc::clone(&self.store);
        let path = tracked.path.clone();
        let join = tokio::spawn(async move {
            if let Err(e) = tailer.run().await {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Tailer failed, dropping file from tracking"
                );
                store.remove(&path);
            }
        });

        debug!(path = %tracked.path.display(), offset = tracked.offset, "Tailer started");
        self.tailers
            .insert(tracked.path.clone(), TailerHandle { join, cancel, wake });
    }

    /// Cooperatively cancel a tailer and wait for it to observe the cancel
    /// and close its file handle.
    pub async fn stop(&mut self, path: &Path) {
        let Some(handle) = self.tailers.remove(path) else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.join.await {
            error!(path = %path.display(), error = %e, "Tailer task panicked");
        }
        debug!(path = %path.display(), "Tailer stopped");
    }

    /// Wake a tailer after a modify event on its file.
    pub fn wake(&self, path: &Path) {
        match self.tailers.get(path) {
            Some(handle) if handle.join.is_finished() => {
                warn!(
                    path = %path.display(),
                    "Modify event for a file whose tailer already closed, dropping"
                );
            }
            Some(handle) => handle.wake.notify_one(),
            None => {
                trace!(path = %path.display(), "Modify event for an untracked file");
            }
        }
    }

    pub fn is_running(&self, path: &Path) -> bool {
        self.tailers.contains_key(path)
    }

    /// Cancel every tailer and await them all. Used on shutdown.
    pub async fn shutdown_all(&mut self) {
        debug!(running = self.tailers.len(), "Stopping all tailers");
        self.cancel.cancel();
        for (path, handle) in self.tailers.drain() {
            if let Err(e) = handle.join.await {
                error!(path = %path.display(), error = %e, "Tailer task panicked");
            }
        }
    }
}
