// Local crates
use crate::metrics::metrics::{POSITION_FLUSH_DURATION_SECONDS, TRACKED_FILES};

// External crates
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::instrument;

/// One tracked file: identity, destination and how far the broker has
/// acknowledged it.
///
/// `inode` is captured when tracking starts; rotation produces a new inode
/// and therefore a new entry. Every byte strictly below `offset` has been
/// acknowledged by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub pattern: String,
    pub topic: String,
    pub inode: u64,
    pub offset: u64,
}

/// Durable `path -> (pattern, topic, inode, offset)` table and its on-disk
/// text form.
///
/// One record per line, `PATH PATTERN TOPIC INODE OFFSET`, space-separated.
/// The file is rewritten in full on each flush. A single store-wide mutex
/// serializes every table mutation and the flush snapshot; the lock is never
/// held across an await point.
#[derive(Debug)]
pub struct PositionStore {
    position_file: PathBuf,
    files: Mutex<HashMap<PathBuf, TrackedFile>>,
}

impl PositionStore {
    pub fn new(position_file: PathBuf) -> Self {
        Self {
            position_file,
            files: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PathBuf, TrackedFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the position file, keeping only records that still describe the
    /// filesystem: the file exists, its inode is unchanged and it has not
    /// shrunk below the recorded offset. Everything else is dropped and left
    /// for the directory scan to rediscover.
    #[instrument(
        name = "position_store::load",
        target = "position::position",
        skip_all,
        level = "debug"
    )]
    pub async fn load(&self) -> Result<()> {
        let contents = match tokio::fs::read_to_string(&self.position_file).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(
                    position_file = %self.position_file.display(),
                    "No position file yet, starting with an empty table"
                );
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read position file {:?}", self.position_file)
                });
            }
        };

        let mut accepted: HashMap<PathBuf, TrackedFile> = HashMap::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(record) = parse_record(line) else {
                tracing::warn!(line, "Skipping malformed position record");
                continue;
            };

            match tokio::fs::metadata(&record.path).await {
                Err(_) => {
                    tracing::debug!(
                        path = %record.path.display(),
                        "Dropping position record, file is gone"
                    );
                }
                Ok(md) if md.ino() != record.inode => {
                    tracing::debug!(
                        path = %record.path.display(),
                        recorded_inode = record.inode,
                        current_inode = md.ino(),
                        "Dropping position record, file was rotated"
                    );
                }
                Ok(md) if md.len() < record.offset => {
                    tracing::debug!(
                        path = %record.path.display(),
                        recorded_offset = record.offset,
                        current_size = md.len(),
                        "Dropping position record, file was truncated"
                    );
                }
                Ok(_) => {
                    accepted.insert(record.path.clone(), record);
                }
            }
        }

        tracing::info!(
            position_file = %self.position_file.display(),
            restored = accepted.len(),
            "Position file loaded"
        );

        let mut table = self.table();
        *table = accepted;
        TRACKED_FILES.set(table.len() as i64);
        Ok(())
    }

    /// Add a file to the table. Idempotent on path: an existing record wins,
    /// so offsets restored from the position file survive the directory scan.
    pub fn upsert(&self, path: PathBuf, pattern: &str, topic: &str, inode: u64, offset: u64) -> bool {
        let mut table = self.table();
        if table.contains_key(&path) {
            return false;
        }
        table.insert(
            path.clone(),
            TrackedFile {
                path,
                pattern: pattern.to_string(),
                topic: topic.to_string(),
                inode,
                offset,
            },
        );
        TRACKED_FILES.set(table.len() as i64);
        true
    }

    /// Advance a path's committed offset. Only the shipper worker calls this,
    /// after the broker acknowledged the batch ending at `offset`.
    pub fn advance(&self, path: &Path, offset: u64) {
        let mut table = self.table();
        match table.get_mut(path) {
            Some(tracked) if offset >= tracked.offset => tracked.offset = offset,
            Some(tracked) => {
                tracing::warn!(
                    path = %path.display(),
                    committed = tracked.offset,
                    requested = offset,
                    "Ignoring non-monotonic offset advance"
                );
            }
            None => {
                tracing::debug!(
                    path = %path.display(),
                    offset,
                    "Offset advance for a path no longer tracked"
                );
            }
        }
    }

    pub fn remove(&self, path: &Path) -> Option<TrackedFile> {
        let mut table = self.table();
        let removed = table.remove(path);
        TRACKED_FILES.set(table.len() as i64);
        removed
    }

    pub fn get(&self, path: &Path) -> Option<TrackedFile> {
        self.table().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.table().contains_key(path)
    }

    pub fn snapshot(&self) -> Vec<TrackedFile> {
        self.table().values().cloned().collect()
    }

    /// Rewrite the position file from the current table. The snapshot is
    /// taken under the store mutex; the write happens outside it, to a
    /// sibling temp file that is renamed into place so a crash mid-write
    /// cannot tear the file.
    #[instrument(
        name = "position_store::flush",
        target = "position::position",
        skip_all,
        level = "trace"
    )]
    pub async fn flush(&self) -> Result<()> {
        let started = Instant::now();

        let mut records = self.snapshot();
        records.sort_by(|a, b| a.path.cmp(&b.path));

        let mut body = String::new();
        for r in &records {
            body.push_str(&format!(
                "{} {} {} {} {}\n",
                r.path.display(),
                r.pattern,
                r.topic,
                r.inode,
                r.offset
            ));
        }

        let tmp = self.position_file.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write position temp file {tmp:?}"))?;
        tokio::fs::rename(&tmp, &self.position_file)
            .await
            .with_context(|| format!("failed to move position file into place at {:?}", self.position_file))?;

        POSITION_FLUSH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        tracing::trace!(
            position_file = %self.position_file.display(),
            records = records.len(),
            "Position file flushed"
        );
        Ok(())
    }
}

fn parse_record(line: &str) -> Option<TrackedFile> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    Some(TrackedFile {
        path: PathBuf::from(fields[0]),
        pattern: fields[1].to_string(),
        topic: fields[2].to_string(),
        inode: fields[3].parse().ok()?,
        offset: fields[4].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn inode_of(path: &Path) -> u64 {
        fs::metadata(path).unwrap().ino()
    }

    #[tokio::test]
    async fn flush_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let log_a = tmp.path().join("app-2024-01-01.log");
        let log_b = tmp.path().join("db-2024-01-01.log");
        fs::write(&log_a, "aaaa\nbbbb\n").unwrap();
        fs::write(&log_b, "cc\n").unwrap();

        let store = PositionStore::new(tmp.path().join("positions"));
        store.upsert(log_a.clone(), "%Y-%m-%d", "app", inode_of(&log_a), 5);
        store.upsert(log_b.clone(), "%Y-%m-%d", "db", inode_of(&log_b), 0);
        store.flush().await.unwrap();

        let reloaded = PositionStore::new(tmp.path().join("positions"));
        reloaded.load().await.unwrap();

        let mut before = store.snapshot();
        let mut after = reloaded.snapshot();
        before.sort_by(|a, b| a.path.cmp(&b.path));
        after.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn load_drops_stale_records() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live.log");
        let shrunk = tmp.path().join("shrunk.log");
        fs::write(&live, "12345\n").unwrap();
        fs::write(&shrunk, "1\n").unwrap();

        let position_file = tmp.path().join("positions");
        let records = format!(
            "{} P T {} 6\n{} P T {} 100\n{} P T {} 0\n{} P T 424242 0\n",
            live.display(),
            inode_of(&live),
            shrunk.display(),
            inode_of(&shrunk),
            tmp.path().join("missing.log").display(),
            7,
            live.display(),
        );
        // Last line repeats `live` with a bogus inode; the first wins because
        // the stale one is rejected.
        fs::write(&position_file, records).unwrap();

        let store = PositionStore::new(position_file);
        store.load().await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].path, live);
        assert_eq!(snapshot[0].offset, 6);
    }

    #[tokio::test]
    async fn load_skips_malformed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let live = tmp.path().join("live.log");
        fs::write(&live, "12345\n").unwrap();

        let position_file = tmp.path().join("positions");
        let records = format!(
            "not enough fields\n{} P T {} zero\n\n{} P T {} 3\n",
            live.display(),
            inode_of(&live),
            live.display(),
            inode_of(&live),
        );
        fs::write(&position_file, records).unwrap();

        let store = PositionStore::new(position_file);
        store.load().await.unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].offset, 3);
    }

    #[tokio::test]
    async fn load_tolerates_missing_position_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PositionStore::new(tmp.path().join("positions"));
        store.load().await.unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn advance_is_monotonic() {
        let store = PositionStore::new(PathBuf::from("/nonexistent/positions"));
        let path = PathBuf::from("/var/log/x.log");
        store.upsert(path.clone(), "P", "T", 1, 10);

        store.advance(&path, 20);
        assert_eq!(store.get(&path).unwrap().offset, 20);

        store.advance(&path, 5);
        assert_eq!(store.get(&path).unwrap().offset, 20);

        // Unknown paths are ignored.
        store.advance(Path::new("/var/log/other.log"), 99);
    }

    #[test]
    fn upsert_keeps_existing_record() {
        let store = PositionStore::new(PathBuf::from("/nonexistent/positions"));
        let path = PathBuf::from("/var/log/x.log");
        assert!(store.upsert(path.clone(), "P", "T", 1, 10));
        assert!(!store.upsert(path.clone(), "P", "T", 2, 0));
        let tracked = store.get(&path).unwrap();
        assert_eq!(tracked.inode, 1);
        assert_eq!(tracked.offset, 10);
    }

    #[test]
    fn remove_forgets_the_path() {
        let store = PositionStore::new(PathBuf::from("/nonexistent/positions"));
        let path = PathBuf::from("/var/log/x.log");
        store.upsert(path.clone(), "P", "T", 1, 0);
        assert!(store.remove(&path).is_some());
        assert!(!store.contains(&path));
        assert!(store.remove(&path).is_none());
    }
}
