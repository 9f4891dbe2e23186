mod cli;
mod helpers;
mod instrumentation;
mod metrics;
mod pattern;
mod position;
mod reaper;
mod runtime;
mod shipper;
mod tailer;
mod watcher;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Main entrypoint simply delegates control to the CLI layer.
    // The CLI parses the flags, installs tracing and hands over to the runtime.
    cli::cli::run().await
}
