//! Shipper - responsibility and behavior
//!
//! The shipper is the single consumer of the batch queue. It takes batches
//! of complete lines from the tailers and reliably forwards them to the
//! broker, and it is the only component allowed to advance committed
//! offsets: a path's offset moves exactly when the broker acknowledges the
//! batch ending there.
//!
//! Key properties:
//! - One worker, FIFO queue: batches for a given path are published and
//!   committed in submission order.
//! - The queue is bounded; tailers block on submit when it fills, which is
//!   the designed backpressure against a slow broker.
//! - Transient broker errors (metadata unavailable, transport trouble) are
//!   retried forever with a one-second pause and a warning per retry.
//! - Any other broker error is operator-visible: it is logged, the global
//!   shutdown is triggered and the worker exits with the error.

// Local crates
use crate::helpers::shutdown::Shutdown;
use crate::metrics::metrics::{BATCHES_SHIPPED_TOTAL, LINES_SHIPPED_TOTAL, SHIP_RETRIES_TOTAL};
use crate::position::position::PositionStore;
use crate::shipper::broker::Broker;
use crate::tailer::payload::Batch;

// External crates
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Handle owned by the runtime: exposes the submit side of the batch queue
/// and manages the background worker's lifecycle.
#[derive(Debug)]
pub struct Shipper {
    sender: mpsc::Sender<Batch>,
    stop: CancellationToken,
    worker_handle: Option<JoinHandle<Result<()>>>,
}

impl Shipper {
    /// Create the bounded batch queue and spawn the worker that drains it.
    pub fn new<B: Broker>(
        broker: B,
        produce: bool,
        queue_capacity: usize,
        store: Arc<PositionStore>,
        shutdown: Shutdown,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let stop = CancellationToken::new();

        let handle = tokio::spawn(run_worker(
            broker,
            produce,
            rx,
            stop.clone(),
            store,
            shutdown,
        ));

        Self {
            sender: tx,
            stop,
            worker_handle: Some(handle),
        }
    }

    /// A clone of the submit side, handed to every tailer. `send` blocks when
    /// the queue is full.
    pub fn sender(&self) -> mpsc::Sender<Batch> {
        self.sender.clone()
    }

    /// Stop the worker and return its final result. Batches still queued are
    /// dropped unacknowledged; their lines are re-read on the next start.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop.cancel();

        match self.worker_handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "Shipper worker task panicked");
                    Err(anyhow::anyhow!("shipper worker panicked: {e}"))
                }
            },
            None => Ok(()),
        }
    }
}

enum Delivery {
    Acked,
    Interrupted,
}

/// Background worker loop: pop a batch, deliver it, commit its offset.
#[instrument(
    name = "shipper::run_worker",
    target = "shipper::shipper",
    skip_all,
    level = "debug"
)]
async fn run_worker<B: Broker>(
    broker: B,
    produce: bool,
    mut rx: mpsc::Receiver<Batch>,
    stop: CancellationToken,
    store: Arc<PositionStore>,
    shutdown: Shutdown,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::debug!("Shipper worker received shutdown signal");
                return Ok(());
            }
            maybe_batch = rx.recv() => {
                let Some(batch) = maybe_batch else {
                    tracing::debug!("Batch queue closed, shipper worker exiting");
                    return Ok(());
                };

                if produce {
                    match deliver(&broker, &batch, &stop).await {
                        Ok(Delivery::Acked) => {}
                        Ok(Delivery::Interrupted) => return Ok(()),
                        Err(e) => {
                            tracing::error!(
                                topic = %batch.topic,
                                path = %batch.path.display(),
                                error = %e,
                                "Fatal broker error, shutting down"
                            );
                            shutdown.trigger();
                            return Err(e);
                        }
                    }
                }

                store.advance(&batch.path, batch.offset);
                BATCHES_SHIPPED_TOTAL.inc();
                LINES_SHIPPED_TOTAL.inc_by(batch.lines.len() as u64);
                tracing::trace!(
                    path = %batch.path.display(),
                    topic = %batch.topic,
                    lines = batch.lines.len(),
                    offset = batch.offset,
                    "Batch acknowledged, offset committed"
                );
            }
        }
    }
}

/// Publish one batch, retrying the retryable error class forever with a
/// one-second pause. Stays responsive to shutdown during the pauses.
async fn deliver<B: Broker>(
    broker: &B,
    batch: &Batch,
    stop: &CancellationToken,
) -> Result<Delivery> {
    loop {
        match broker.publish(&batch.topic, &batch.lines).await {
            Ok(()) => return Ok(Delivery::Acked),
            Err(e) if e.is_retryable() => {
                SHIP_RETRIES_TOTAL.inc();
                tracing::warn!(
                    topic = %batch.topic,
                    path = %batch.path.display(),
                    error = %e,
                    "Transient broker error, retrying in 1s"
                );
                tokio::select! {
                    _ = stop.cancelled() => return Ok(Delivery::Interrupted),
                    _ = sleep(Duration::from_secs(1)) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}
