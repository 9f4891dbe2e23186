// Local crates
use crate::{instrumentation, runtime};

// External crates
use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tailfeed",
    version,
    about = "Tails rotated log files and publishes new lines to Kafka",
    long_about = "Follows a dynamic set of append-only log files, splits appended bytes into \
lines and publishes them to Kafka, one topic per configured file pattern. Restart-safe \
through a durable position file.",
    after_help = "\
    EXAMPLES:
        tailfeed --config /etc/tailfeed.toml
        tailfeed --config ./tailfeed.toml --log-level debug"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Default log verbosity; an explicit RUST_LOG filter takes precedence
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Accepted for compatibility with older deployments; maps to `error`
    Fatal,
    /// Accepted for compatibility with older deployments; maps to `info`
    Unknown,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info | LogLevel::Unknown => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

/// Entry function for the CLI.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    instrumentation::tracing::init_tracing(cli.log_level);
    instrumentation::tracing::init_panic_handler();

    runtime::runtime::run_agent(cli.config).await
}
