// External crates
use std::path::PathBuf;

/// Filesystem activity after translation from raw `notify` events, reduced
/// to the three classes the dispatcher cares about. Appear/remove drive
/// tracking lifecycle; modify drives tailer wakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    FileAppeared(PathBuf),
    FileRemoved(PathBuf),
    FileModified(PathBuf),
}
