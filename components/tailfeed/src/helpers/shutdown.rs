// External crates
use tokio::sync::broadcast;

/// Global shutdown manager, built on top of a broadcast channel.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Creates a new shutdown broadcast channel.
    /// A small buffer is sufficient since only one message is ever sent.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self { tx }
    }

    /// Returns a new receiver handle for a runtime component.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown event, notifying every subscribed component.
    pub fn trigger(&self) {
        tracing::info!("Shutdown triggered, notifying all runtime components");
        let _ = self.tx.send(());
    }

    /// Block until `.trigger()` is called. Used by the top-level runtime.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.recv().await;
        tracing::info!("Shutdown signal received");
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
