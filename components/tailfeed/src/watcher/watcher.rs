// Local crates
use crate::pattern::pattern::PatternRegistry;
use crate::position::position::PositionStore;
use crate::tailer::manager::TailerManager;
use crate::watcher::{discovery, events::translate_event, models::WatcherEvent};

// External crates
use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{debug, info, instrument, trace};

/// Watches every configured directory for file lifecycle events and data
/// writes, and drives the tailer manager from them.
///
/// One `notify` subscription covers both roles the engine needs: creates and
/// renames feed tracking changes, data modifications feed tailer wakes. The
/// watcher also performs startup recovery before entering its event loop, so
/// every tracked file has a running tailer by the time events flow.
#[derive(Debug)]
pub struct Watcher {
    registry: Arc<PatternRegistry>,
    store: Arc<PositionStore>,
    manager: TailerManager,
}

impl Watcher {
    pub fn new(
        registry: Arc<PatternRegistry>,
        store: Arc<PositionStore>,
        manager: TailerManager,
    ) -> Self {
        Self {
            registry,
            store,
            manager,
        }
    }

    /// Main dispatcher loop. Subscribes to the watched directories, brings
    /// the tailers up from the recovered position table, then routes
    /// translated events until shutdown.
    #[instrument(
        name = "watcher::run",
        target = "watcher::watcher",
        skip_all,
        level = "debug"
    )]
    pub async fn run(
        mut self,
        from_beginning: bool,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (fs_tx, fs_rx) = mpsc::channel(128);

        let mut watcher = RecommendedWatcher::new(
            move |res| match res {
                Ok(event) => {
                    let _ = fs_tx.blocking_send(event);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Filesystem watcher error callback");
                }
            },
            notify::Config::default(),
        )
        .context("failed to create filesystem watcher")?;

        // Subscribe before scanning so files appearing mid-scan are not lost.
        for watched in &self.registry.dirs {
            watcher
                .watch(&watched.dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("failed to watch directory {:?}", watched.dir))?;
            debug!(dir = %watched.dir.display(), "Watching directory");
        }

        discovery::scan_existing(&self.registry, &self.store, from_beginning).await?;
        for tracked in self.store.snapshot() {
            self.manager.start(&tracked);
        }
        self.store
            .flush()
            .await
            .context("initial position flush failed")?;

        info!(tracked = self.store.snapshot().len(), "Watcher running");

        let mut event_stream = ReceiverStream::new(fs_rx);
        loop {
            tokio::select! {
                Some(event) = event_stream.next() => {
                    for ev in translate_event(event) {
                        self.dispatch(ev).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Watcher received shutdown signal");
                    break;
                }
            }
        }

        self.manager.shutdown_all().await;
        Ok(())
    }

    async fn dispatch(&mut self, event: WatcherEvent) {
        match event {
            WatcherEvent::FileAppeared(path) => self.handle_appeared(path).await,
            WatcherEvent::FileRemoved(path) => self.handle_removed(path).await,
            WatcherEvent::FileModified(path) => self.manager.wake(&path),
        }
    }

    /// A path showed up in a watched directory, by create or move-in. If it
    /// matches a registered pattern it enters tracking at offset zero; a
    /// newly appearing file has no history worth skipping.
    async fn handle_appeared(&mut self, path: PathBuf) {
        let Some(entry) = self.registry.match_path(&path) else {
            trace!(path = %path.display(), "Appeared file matches no pattern");
            return;
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Appeared file vanished before stat");
                return;
            }
        };
        if metadata.is_dir() {
            return;
        }

        if self.store.contains(&path) {
            // Known path, e.g. an event raced the startup scan. Make sure a
            // tailer is alive and leave the recorded offset alone.
            if !self.manager.is_running(&path)
                && let Some(tracked) = self.store.get(&path)
            {
                self.manager.start(&tracked);
            }
            return;
        }

        info!(
            path = %path.display(),
            topic = %entry.topic,
            inode = metadata.ino(),
            "New file appeared, tracking from offset 0"
        );
        self.store
            .upsert(path.clone(), &entry.time_pattern, &entry.topic, metadata.ino(), 0);
        if let Some(tracked) = self.store.get(&path) {
            self.manager.start(&tracked);
        }
    }

    /// A tracked path left the directory, by delete or move-out. Stop its
    /// tailer first and only then drop the table entry, so no read can race
    /// the removal.
    async fn handle_removed(&mut self, path: PathBuf) {
        if !self.store.contains(&path) && !self.manager.is_running(&path) {
            trace!(path = %path.display(), "Removed file was not tracked");
            return;
        }

        self.manager.stop(&path).await;
        if self.store.remove(&path).is_some() {
            info!(path = %path.display(), "File removed, dropped from tracking");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::load_config::FileSpecConfig;
    use crate::tailer::payload::Batch;
    use std::fs;
    use std::io::Write;
    use tokio::time::{Duration, timeout};
    use tokio_util::sync::CancellationToken;

    async fn recv_batch(rx: &mut mpsc::Receiver<Batch>) -> Batch {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("batch channel closed")
    }

    #[tokio::test]
    async fn dispatches_create_append_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            PatternRegistry::from_config(&[FileSpecConfig {
                topic: "app".into(),
                prefix: format!("{}/app-", tmp.path().display()),
                suffix: ".log".into(),
                time_pattern: "%Y-%m-%d".into(),
            }])
            .unwrap(),
        );
        let dir = registry.dirs[0].dir.clone();

        let store = Arc::new(PositionStore::new(tmp.path().join("positions")));
        let (tx, mut rx) = mpsc::channel(8);
        let manager = TailerManager::new(Arc::clone(&store), tx, CancellationToken::new(), 16, 4);

        let shutdown = crate::helpers::shutdown::Shutdown::new();
        let watcher = Watcher::new(Arc::clone(&registry), Arc::clone(&store), manager);
        let handle = tokio::spawn(watcher.run(false, shutdown.subscribe()));

        // Give the watcher a moment to subscribe and flush its empty table.
        timeout(Duration::from_secs(5), async {
            while !tmp.path().join("positions").exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A new file appears and grows.
        let path = dir.join("app-2024-01-01.log");
        fs::write(&path, "hello\n").unwrap();
        let batch = recv_batch(&mut rx).await;
        assert_eq!(batch.lines, vec!["hello"]);
        assert_eq!(batch.offset, 6);
        assert_eq!(store.get(&path).map(|t| t.offset), Some(0));

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"world\n").unwrap();
        drop(f);
        let batch = recv_batch(&mut rx).await;
        assert_eq!(batch.lines, vec!["world"]);
        assert_eq!(batch.offset, 12);

        // The file disappears and leaves tracking.
        fs::remove_file(&path).unwrap();
        timeout(Duration::from_secs(5), async {
            while store.contains(&path) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_matching_files_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            PatternRegistry::from_config(&[FileSpecConfig {
                topic: "app".into(),
                prefix: format!("{}/app-", tmp.path().display()),
                suffix: ".log".into(),
                time_pattern: "%Y-%m-%d".into(),
            }])
            .unwrap(),
        );
        let dir = registry.dirs[0].dir.clone();

        let store = Arc::new(PositionStore::new(tmp.path().join("positions")));
        let (tx, _rx) = mpsc::channel(8);
        let manager = TailerManager::new(Arc::clone(&store), tx, CancellationToken::new(), 16, 4);

        let shutdown = crate::helpers::shutdown::Shutdown::new();
        let watcher = Watcher::new(Arc::clone(&registry), Arc::clone(&store), manager);
        let handle = tokio::spawn(watcher.run(false, shutdown.subscribe()));

        fs::write(dir.join("notes.txt"), "nope\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.snapshot().is_empty());

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }
}
