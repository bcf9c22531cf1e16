//! `seqxfer`: moves tagged sequencing data between storages.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use seqxfer_blob::AzureConnector;
use seqxfer_catalog::{RestCatalog, run_remote_transfer, wait_for_tasks};
use seqxfer_orchestrator::{BatchReport, Coordinator, Dispatcher};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "seqxfer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/seqxfer/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Files transferred at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Seconds between two status polls of a running task or copy
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transfer every file tagged <TAG> from one storage to another
    Transfer {
        tag: String,
        from: String,
        to: String,
    },

    /// Have the catalog run the transfer as a named job and wait for it
    RemoteTransfer {
        tag: String,
        from: String,
        to: String,
        /// Job name; an existing job with this name is joined
        #[arg(long)]
        name: String,
    },

    /// Wait for catalog tasks to finish
    Wait {
        #[arg(required = true)]
        tasks: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,seqxfer=debug")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(secs) = cli.poll_interval {
        config.poll_interval_secs = secs;
    }

    let catalog = Arc::new(RestCatalog::from_env(config.api_url.as_deref())?);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Command::Transfer { tag, from, to } => {
            let http = reqwest::Client::builder().build()?;
            let connector = Arc::new(AzureConnector::new(http, config.azure_options()));
            let dispatcher = Dispatcher::new(connector, config.strategy_options());
            let coordinator = Coordinator::new(catalog, dispatcher, config.coordinator_options());

            let batch_cancel = coordinator.cancel_token();
            let forward = cancel.clone();
            tokio::spawn(async move {
                forward.cancelled().await;
                batch_cancel.cancel();
            });

            let report = coordinator.transfer(&tag, &from, &to).await?;
            print_report(&report);
            report.into_result()?;
        }
        Command::RemoteTransfer {
            tag,
            from,
            to,
            name,
        } => {
            let job = run_remote_transfer(
                catalog.as_ref(),
                &config.poller(),
                &from,
                &to,
                &tag,
                &name,
                &cancel,
            )
            .await?;
            println!("transfer job {} ({}) finished: {}", job.name, job.id, job.state);
        }
        Command::Wait { tasks } => {
            let finished = wait_for_tasks(catalog.as_ref(), &config.poller(), &tasks, &cancel).await?;
            for status in finished {
                println!("task {} finished: {}", status.id, status.state);
            }
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
}

fn print_report(report: &BatchReport) {
    println!(
        "{}: {} transferred, {} skipped, {} failed",
        report.tag,
        report.transferred,
        report.skipped,
        report.failed.len()
    );
    for failure in &report.failed {
        println!(
            "  {} (resource {}): {}: {}",
            failure.filename, failure.resource_id, failure.kind, failure.message
        );
    }
}
