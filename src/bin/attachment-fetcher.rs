#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Host process for the attachment fetcher
//!
//! Loads the configuration from the environment, installs the log
//! sink and drives the poll loop until Ctrl-C or SIGTERM.

use clap::{Parser, Subcommand};
use mail_attachment_fetcher::{Config, Fetcher, SelectionPolicy, TickReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "attachment-fetcher")]
#[command(about = "Save attachments of new IMAP mail to a local directory")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Seconds between polls (overrides POLL_INTERVAL_SECS)
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// Output directory (overrides ATTACHMENT_DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Which unseen messages to process: latest or all
    /// (overrides SELECTION_POLICY)
    #[arg(long, global = true)]
    policy: Option<SelectionPolicy>,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll continuously until interrupted
    Run,

    /// Poll once and exit
    Once {
        /// Print the tick report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(args.log_dir.as_deref());

    let mut config = Config::from_env()?;
    if let Some(secs) = args.interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(dir) = &args.dir {
        config.attachment_dir.clone_from(dir);
    }
    if let Some(policy) = args.policy {
        config.selection = policy;
    }

    let fetcher = Arc::new(Fetcher::new(config)?);

    match args.command {
        Command::Run => cmd_run(&fetcher).await?,
        Command::Once { json } => cmd_once(&fetcher, json).await?,
    }

    Ok(())
}

async fn cmd_run(fetcher: &Arc<Fetcher>) -> anyhow::Result<()> {
    let handle = fetcher.start()?;
    shutdown_signal().await;
    info!("Shutdown signal received");
    fetcher.stop();
    handle.await?;
    Ok(())
}

async fn cmd_once(fetcher: &Fetcher, json: bool) -> anyhow::Result<()> {
    let report = fetcher.run_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn print_report(report: &TickReport) {
    println!("Unseen:    {}", report.unseen);
    println!(
        "Processed: {}",
        report
            .processed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Skipped:   {}", report.skipped);
    println!("Failures:  {}", report.failures);

    if report.saved.is_empty() {
        println!("\nNo attachments saved.");
        return;
    }

    println!("\n--- Saved ---");
    for path in &report.saved {
        println!("  {}", path.display());
    }
}

/// Log to stderr, and to `<log_dir>/attachment-fetcher.log.<date>`
/// when a directory is given. The guard must outlive `main`'s work.
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "attachment-fetcher.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        tokio::signal::ctrl_c().await.ok();
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
