// External crates
use std::path::PathBuf;

/// The hand-off unit between a tailer and the shipper worker: a group of
/// complete lines read from one file, plus the file position immediately
/// after the last of them.
///
/// A batch never carries a partial trailing line; the partial remainder stays
/// inside the tailer until the line completes. The committed offset for
/// `path` moves to `offset` only once the broker has acknowledged every line
/// in the batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub path: PathBuf,
    pub topic: String,
    pub lines: Vec<String>,
    pub offset: u64,
}
