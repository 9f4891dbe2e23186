// Local crates
use crate::pattern::pattern::PatternRegistry;
use crate::position::position::PositionStore;

// External crates
use anyhow::{Context, Result};
use std::os::unix::fs::MetadataExt;
use tracing::{debug, info, warn};

/// Startup scan: enumerate every watched directory for files that already
/// match a registered pattern and are not yet in the position table.
///
/// Paths restored from the position file keep their recorded offsets; newly
/// discovered files start at zero or at their current size depending on
/// `from_beginning`. Files appearing after this scan are handled by the
/// event path and always start at zero.
pub async fn scan_existing(
    registry: &PatternRegistry,
    store: &PositionStore,
    from_beginning: bool,
) -> Result<()> {
    for watched in &registry.dirs {
        let mut entries = tokio::fs::read_dir(&watched.dir)
            .await
            .with_context(|| format!("failed to read watched directory {:?}", watched.dir))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to enumerate {:?}", watched.dir))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(pattern) = watched.entries.iter().find(|e| e.matches(name)) else {
                continue;
            };

            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat matching file, skipping");
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }

            if store.contains(&path) {
                debug!(path = %path.display(), "Already restored from the position file");
                continue;
            }

            let offset = if from_beginning { 0 } else { metadata.len() };
            store.upsert(
                path.clone(),
                &pattern.time_pattern,
                &pattern.topic,
                metadata.ino(),
                offset,
            );
            info!(
                path = %path.display(),
                topic = %pattern.topic,
                inode = metadata.ino(),
                offset,
                "Discovered existing file at startup"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::load_config::FileSpecConfig;
    use std::fs;
    use std::path::PathBuf;

    fn registry(dir: &std::path::Path) -> PatternRegistry {
        PatternRegistry::from_config(&[FileSpecConfig {
            topic: "app".into(),
            prefix: format!("{}/app-", dir.display()),
            suffix: ".log".into(),
            time_pattern: "%Y-%m-%d".into(),
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn tracks_matching_files_at_current_size() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("app-2024-01-01.log"), "hello\n").unwrap();
        fs::write(tmp.path().join("unrelated.txt"), "ignored\n").unwrap();

        let registry = registry(tmp.path());
        let store = PositionStore::new(PathBuf::from("/nonexistent/positions"));
        scan_existing(&registry, &store, false).await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].topic, "app");
        assert_eq!(snapshot[0].offset, 6);
    }

    #[tokio::test]
    async fn from_beginning_tracks_at_zero() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("app-2024-01-01.log"), "hello\n").unwrap();

        let registry = registry(tmp.path());
        let store = PositionStore::new(PathBuf::from("/nonexistent/positions"));
        scan_existing(&registry, &store, true).await.unwrap();

        assert_eq!(store.snapshot()[0].offset, 0);
    }

    #[tokio::test]
    async fn position_record_wins_over_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app-2024-01-01.log");
        fs::write(&path, "hello\n").unwrap();

        let registry = registry(tmp.path());
        let store = PositionStore::new(PathBuf::from("/nonexistent/positions"));
        store.upsert(
            registry.dirs[0].dir.join("app-2024-01-01.log"),
            "%Y-%m-%d",
            "app",
            42,
            3,
        );
        scan_existing(&registry, &store, true).await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].offset, 3);
        assert_eq!(snapshot[0].inode, 42);
    }
}
