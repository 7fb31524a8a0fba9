use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod app;
mod commands;
mod http;
mod jobs;

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("TXND_GIT_SHA"), ")");

#[derive(Debug, Parser)]
#[command(name = "txnd", version, long_version = LONG_VERSION, about = "Persistent job queue daemon")]
pub struct Cli {
    /// Config file (default: $TXND_CONFIG, then ~/.txnd/txnd.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the background.
    Start,
    /// Stop the running daemon once its jobs have finished.
    Stop,
    /// Stop the daemon if it runs, then start it again.
    Restart,
    /// Show the latest health snapshot.
    Status,
    /// Run the daemon attached to this terminal.
    Foreground,
    /// List running, runnable and scheduled transactions.
    List,
    /// Show the latest log entry of a transaction id or classname.
    Log { target: String },
    /// Queue a transaction for a registered job type.
    Enqueue {
        classname: String,
        /// JSON object passed to the job.
        #[arg(long)]
        data: Option<String>,
        /// Delay before the transaction becomes runnable.
        #[arg(long, conflicts_with = "parked")]
        in_secs: Option<i64>,
        #[arg(long)]
        recurring: bool,
        /// Store without scheduling.
        #[arg(long)]
        parked: bool,
    },
    /// Execute one claimed transaction (started by the daemon).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: i64,
    },
    /// Serve the health endpoint.
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txnd=info,txnd_engine=info,txnd_store=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
