// Local crates
use crate::{
    helpers::{load_config::Config, shutdown::Shutdown},
    metrics::http::start_metrics_server,
    pattern::pattern::PatternRegistry,
    position::position::PositionStore,
    reaper::reaper::Reaper,
    shipper::broker::{Broker, KafkaBroker},
    shipper::shipper::Shipper,
    tailer::manager::TailerManager,
    watcher::watcher::Watcher,
};

// External crates
use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{signal, sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Everything the agent runs: position store, shipper, watcher with its
/// tailers, and the periodic tasks. Constructed once at startup and torn
/// down on shutdown, so all runtime state has an explicit owner and
/// lifetime.
#[derive(Debug)]
pub struct Engine {
    shutdown: Shutdown,
    cancel: CancellationToken,
    store: Arc<PositionStore>,
    shipper: Shipper,
    watcher_handle: JoinHandle<Result<()>>,
    timer_handles: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Wire the components together and bring the pipeline up: load the
    /// position table, scan for pre-existing files, start the tailers and
    /// the periodic tasks.
    #[instrument(
        name = "engine::start",
        target = "runtime::runtime",
        skip_all,
        level = "debug"
    )]
    pub async fn start<B: Broker>(cfg: Config, broker: B) -> Result<Self> {
        let shutdown = Shutdown::new();
        let cancel = CancellationToken::new();

        let registry = Arc::new(PatternRegistry::from_config(&cfg.tailf.files)?);
        let store = Arc::new(PositionStore::new(PathBuf::from(&cfg.tailf.position_file)));
        store.load().await?;

        let shipper = Shipper::new(
            broker,
            cfg.kafka.produce,
            cfg.tailf.max_batches * 10,
            Arc::clone(&store),
            shutdown.clone(),
        );

        let manager = TailerManager::new(
            Arc::clone(&store),
            shipper.sender(),
            cancel.child_token(),
            cfg.tailf.max_batch_lines,
            cfg.tailf.max_batches,
        );

        let watcher = Watcher::new(Arc::clone(&registry), Arc::clone(&store), manager);
        let watcher_handle = tokio::spawn({
            let shutdown = shutdown.clone();
            let shutdown_rx = shutdown.subscribe();
            let from_beginning = cfg.tailf.from_beginning;
            async move {
                let result = watcher.run(from_beginning, shutdown_rx).await;
                if let Err(e) = &result {
                    error!(error = %e, "Watcher exited with error, shutting down");
                    shutdown.trigger();
                }
                result
            }
        });

        let mut timer_handles = Vec::new();
        timer_handles.push(spawn_flush_timer(
            Arc::clone(&store),
            cfg.tailf.flush_interval,
            shutdown.subscribe(),
        ));

        if cfg.tailf.delete_old_tailed_files {
            let reaper = Reaper::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                cfg.tailf.post_delete_command.clone(),
            );
            timer_handles.push(tokio::spawn(reaper.run(shutdown.subscribe())));
            info!("Reaper enabled");
        }

        if let Some(addr) = cfg.tailf.metrics_addr.clone() {
            timer_handles.push(spawn_metrics_server(addr, shutdown.subscribe()));
        }

        Ok(Self {
            shutdown,
            cancel,
            store,
            shipper,
            watcher_handle,
            timer_handles,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Block until shutdown is triggered, then tear the pipeline down.
    pub async fn run(self) -> Result<()> {
        self.shutdown.wait_for_shutdown().await;
        self.teardown().await
    }

    /// Trigger shutdown and tear the pipeline down.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.trigger();
        self.teardown().await
    }

    /// Ordered teardown: the watcher stops its tailers, the shipper worker
    /// drains out, and only then is the final position flush written so it
    /// reflects every acknowledged offset.
    async fn teardown(mut self) -> Result<()> {
        let watcher_result = match self.watcher_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("watcher task panicked: {e}")),
        };

        // Backstop for tailers whose supervisor died before cancelling them.
        self.cancel.cancel();

        for handle in self.timer_handles.drain(..) {
            let _ = handle.await;
        }

        let shipper_result = self.shipper.shutdown().await;

        self.store
            .flush()
            .await
            .context("final position flush failed")?;

        info!("Runtime shutdown complete");
        watcher_result.and(shipper_result)
    }
}

/// Agent entrypoint: load configuration, connect the Kafka producer, start
/// the engine and wait for CTRL+C.
pub async fn run_agent(config_path: PathBuf) -> Result<()> {
    info!(
        configuration_file_path = %config_path.display(),
        "Starting tailfeed runtime"
    );

    let cfg = Config::load(&config_path)?;
    let broker = KafkaBroker::from_config(&cfg.kafka)?;
    let engine = Engine::start(cfg, broker).await?;

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("CTRL+C received, broadcasting shutdown to runtime components");
                shutdown.trigger();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for CTRL+C shutdown signal");
            }
        }
    });

    engine.run().await
}

/// Rewrite the position file every `flush_interval` seconds.
fn spawn_flush_timer(
    store: Arc<PositionStore>,
    flush_interval: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Flush timer received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(tokio::time::Duration::from_secs(flush_interval)) => {
                    if let Err(e) = store.flush().await {
                        error!(error = %e, "Periodic position flush failed");
                    }
                }
            }
        }
    })
}

fn spawn_metrics_server(
    addr: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = start_metrics_server(&addr) => {
                if let Err(e) = res {
                    error!(error = %e, "Metrics server failed");
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Metrics server received shutdown signal");
            }
        }
    })
}
