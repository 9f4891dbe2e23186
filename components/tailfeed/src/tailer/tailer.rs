// Local crates
use crate::tailer::payload::Batch;

// External crates
use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Follows one file: reads appended bytes from the committed offset forward,
/// splits them into complete lines, carries the partial trailing line across
/// reads and hands batches to the shipper.
///
/// Each tailer runs as its own task and exclusively owns its read state
/// (handle position and partial remainder), so a modify wake can never race
/// an in-progress drain. The local cursor runs ahead of the committed offset
/// by exactly the batches still in flight.
#[derive(Debug)]
pub struct Tailer {
    path: PathBuf,
    topic: String,
    offset: u64,
    reader: Option<BufReader<File>>,
    remainder: String,
    remainder_bytes: u64,
    max_batch_lines: usize,
    max_batches: usize,
    submit: mpsc::Sender<Batch>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl Tailer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: PathBuf,
        topic: String,
        offset: u64,
        max_batch_lines: usize,
        max_batches: usize,
        submit: mpsc::Sender<Batch>,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            path,
            topic,
            offset,
            reader: None,
            remainder: String::new(),
            remainder_bytes: 0,
            max_batch_lines,
            max_batches,
            submit,
            wake,
            cancel,
        }
    }

    /// Open the file read-only and seek to the committed offset.
    async fn open(&mut self) -> Result<()> {
        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("couldn't open {} for tailing", self.path.display()))?;

        file.seek(SeekFrom::Start(self.offset))
            .await
            .with_context(|| {
                format!(
                    "couldn't seek {} to offset {}",
                    self.path.display(),
                    self.offset
                )
            })?;

        tracing::debug!(
            path = %self.path.display(),
            offset = self.offset,
            "Opened file for tailing"
        );
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    /// Main loop. The first drain after open is unbounded, so content that
    /// accumulated while the process was down is caught up in one go. After
    /// that the tailer sleeps until a modify event wakes it, and each wake
    /// drains at most `max_batches` batches so one busy file cannot starve
    /// the rest.
    #[instrument(
        name = "tailer::run",
        target = "tailer::tailer",
        skip_all,
        fields(path = %self.path.display()),
        level = "debug"
    )]
    pub async fn run(mut self) -> Result<()> {
        self.open().await?;
        self.drain(usize::MAX).await?;

        let wake = Arc::clone(&self.wake);
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(path = %self.path.display(), "Tailer cancelled");
                    break;
                }
                _ = wake.notified() => {
                    if !self.drain(self.max_batches).await? {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Read and submit up to `max_iterations` batches. Returns `false` when
    /// the tailer should stop (cancelled, or the batch queue is gone).
    async fn drain(&mut self, max_iterations: usize) -> Result<bool> {
        for _ in 0..max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            let Some(batch) = self.next_batch().await? else {
                return Ok(true);
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Batch dropped unacknowledged; it is re-read if the file
                    // ever comes back.
                    return Ok(false);
                }
                res = self.submit.send(batch) => {
                    if res.is_err() {
                        tracing::warn!(
                            path = %self.path.display(),
                            "Batch queue closed before batch was accepted, stopping tailer"
                        );
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Collect up to `max_batch_lines` complete lines starting at the current
    /// cursor. A trailing read without a newline is held as the partial
    /// remainder (its bytes are not part of the batch offset) and prepended
    /// to the first line completed later.
    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("tailer for {} is not open", self.path.display()))?;

        let mut lines = Vec::new();
        let mut end = self.offset;

        while lines.len() < self.max_batch_lines {
            let mut chunk = String::new();
            let n = reader
                .read_line(&mut chunk)
                .await
                .with_context(|| format!("read error on {}", self.path.display()))?;
            if n == 0 {
                break;
            }

            if !chunk.ends_with('\n') {
                // Partial tail of the file; keep it until the newline shows up.
                self.remainder.push_str(&chunk);
                self.remainder_bytes += n as u64;
                break;
            }

            let line = if self.remainder.is_empty() {
                chunk
            } else {
                let mut joined = std::mem::take(&mut self.remainder);
                joined.push_str(&chunk);
                joined
            };

            end += self.remainder_bytes + n as u64;
            self.remainder_bytes = 0;
            lines.push(line.trim().to_string());
        }

        if lines.is_empty() {
            return Ok(None);
        }

        self.offset = end;
        Ok(Some(Batch {
            path: self.path.clone(),
            topic: self.topic.clone(),
            lines,
            offset: end,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use tokio::time::{Duration, timeout};

    fn append(path: &Path, data: &str) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn tailer(
        path: &Path,
        offset: u64,
        max_batch_lines: usize,
        max_batches: usize,
    ) -> (Tailer, mpsc::Receiver<Batch>, Arc<Notify>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let t = Tailer::new(
            path.to_path_buf(),
            "test-topic".to_string(),
            offset,
            max_batch_lines,
            max_batches,
            tx,
            Arc::clone(&wake),
            cancel.clone(),
        );
        (t, rx, wake, cancel)
    }

    async fn recv(rx: &mut mpsc::Receiver<Batch>) -> Batch {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("batch channel closed")
    }

    #[tokio::test]
    async fn batches_complete_lines_and_holds_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        std::fs::write(&path, "x\ny\nz").unwrap();

        let (mut t, _rx, _wake, _cancel) = tailer(&path, 0, 2, 10);
        t.open().await.unwrap();

        let batch = t.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, vec!["x", "y"]);
        assert_eq!(batch.offset, 4);

        // "z" has no newline yet: held as remainder, no batch.
        assert!(t.next_batch().await.unwrap().is_none());

        append(&path, "zz\n");
        let batch = t.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, vec!["zzz"]);
        assert_eq!(batch.offset, 8);
    }

    #[tokio::test]
    async fn remainder_grows_across_several_partial_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        std::fs::write(&path, "ab").unwrap();

        let (mut t, _rx, _wake, _cancel) = tailer(&path, 0, 8, 10);
        t.open().await.unwrap();

        assert!(t.next_batch().await.unwrap().is_none());
        append(&path, "cd");
        assert!(t.next_batch().await.unwrap().is_none());
        append(&path, "ef\n");

        let batch = t.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, vec!["abcdef"]);
        assert_eq!(batch.offset, 7);
    }

    #[tokio::test]
    async fn strips_surrounding_whitespace() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        std::fs::write(&path, "  hello \r\n\tworld\n").unwrap();

        let (mut t, _rx, _wake, _cancel) = tailer(&path, 0, 8, 10);
        t.open().await.unwrap();

        let batch = t.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, vec!["hello", "world"]);
        assert_eq!(batch.offset, 17);
    }

    #[tokio::test]
    async fn resumes_from_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        std::fs::write(&path, "old\nnew\n").unwrap();

        let (mut t, _rx, _wake, _cancel) = tailer(&path, 4, 8, 10);
        t.open().await.unwrap();

        let batch = t.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.lines, vec!["new"]);
        assert_eq!(batch.offset, 8);
    }

    #[tokio::test]
    async fn initial_drain_catches_up_then_wakes_on_notify() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        std::fs::write(&path, "a\nb\n").unwrap();

        let (t, mut rx, wake, cancel) = tailer(&path, 0, 1, 10);
        let handle = tokio::spawn(t.run());

        assert_eq!(recv(&mut rx).await.lines, vec!["a"]);
        assert_eq!(recv(&mut rx).await.lines, vec!["b"]);

        append(&path, "c\n");
        wake.notify_one();
        let batch = recv(&mut rx).await;
        assert_eq!(batch.lines, vec!["c"]);
        assert_eq!(batch.offset, 6);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wake_drains_at_most_max_batches() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let (t, mut rx, wake, cancel) = tailer(&path, 0, 1, 2);
        let handle = tokio::spawn(t.run());

        // Let the initial drain hit EOF and park before appending, so the
        // three lines can only move through bounded wakes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&path, "1\n2\n3\n");
        wake.notify_one();
        assert_eq!(recv(&mut rx).await.lines, vec!["1"]);
        assert_eq!(recv(&mut rx).await.lines, vec!["2"]);
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "third batch must wait for the next wake"
        );

        wake.notify_one();
        assert_eq!(recv(&mut rx).await.lines, vec!["3"]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn open_fails_for_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (t, _rx, _wake, _cancel) = tailer(&tmp.path().join("gone.log"), 0, 1, 1);
        assert!(t.run().await.is_err());
    }
}
