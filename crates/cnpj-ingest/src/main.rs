//! cnpj-ingest - run the CNPJ ingestion pipeline once

use anyhow::{Context, Result};
use clap::Parser;
use cnpj_common::logging::{init_logging, LogConfig, LogLevel};
use cnpj_ingest::config::DownloadMode;
use cnpj_ingest::coordinator::EXIT_FATAL;
use cnpj_ingest::{FileState, Pipeline, PipelineConfig, PipelineRun};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cnpj-ingest", version, about = "Load the Receita Federal CNPJ open dataset")]
struct Cli {
    /// Rows per batch (derived from available memory when omitted)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Percent of available memory used to size batches
    #[arg(long)]
    memory_percent: Option<u8>,

    /// Download strategy: sequential or parallel
    #[arg(long)]
    strategy: Option<String>,

    /// Parallel download workers
    #[arg(long)]
    workers: Option<usize>,

    /// Keep downloaded archives after loading
    #[arg(long)]
    keep_files: bool,

    /// Clear the processed-file ledger and exit
    #[arg(long)]
    reset_ledger: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json_summary: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = match LogConfig::default().merge_env() {
        Ok(mut config) => {
            if cli.verbose {
                config.level = LogLevel::Debug;
            }
            config
        },
        Err(e) => {
            eprintln!("Error: invalid logging configuration: {:#}", e);
            process::exit(EXIT_FATAL);
        },
    };
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Run aborted");
            eprintln!("Error: {:#}", e);
            EXIT_FATAL
        },
    };

    drop(guard);
    process::exit(code);
}

async fn run(cli: &Cli) -> Result<i32> {
    let mut config = PipelineConfig::from_env()?;
    apply_overrides(&mut config, cli)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, letting in-flight files finish");
                cancel.cancel();
            }
        }
    });

    let (pipeline, store) = Pipeline::from_config(&config, cancel).await?;

    if cli.reset_ledger {
        let removed = pipeline.ledger().reset().await.context("Failed to reset ledger")?;
        info!(removed, "Ledger reset");
        println!("Ledger reset: {} entries removed", removed);
        store.close().await;
        return Ok(0);
    }

    let result = pipeline.run().await;
    store.close().await;
    let run = result?;

    print_summary(&run, cli.json_summary)?;
    Ok(run.exit_code())
}

fn apply_overrides(config: &mut PipelineConfig, cli: &Cli) -> Result<()> {
    if let Some(n) = cli.batch_size {
        config.batch_size = Some(n);
    }
    if let Some(p) = cli.memory_percent {
        config.memory_percent = p;
    }
    if let Some(ref s) = cli.strategy {
        config.download_mode = s.parse::<DownloadMode>()?;
    }
    if let Some(n) = cli.workers {
        config.download_workers = Some(n);
    }
    if cli.keep_files {
        config.keep_downloaded_files = true;
    }
    config.validate().context("Invalid command-line options")
}

fn print_summary(run: &PipelineRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!("CNPJ ingestion summary");
    println!("  files total:     {}", run.files_total);
    println!("  skipped:         {}", run.files_skipped);
    println!("  loaded:          {}", run.files_succeeded);
    println!("  failed:          {}", run.files_failed);
    if run.files_cancelled > 0 {
        println!("  cancelled:       {}", run.files_cancelled);
    }
    println!("  rows loaded:     {}", run.rows_loaded);
    println!("  rows skipped:    {}", run.rows_skipped);
    println!("  duration:        {:.1}s", run.duration_seconds);

    for file in run.files.iter().filter(|f| f.state == FileState::Failed) {
        println!(
            "  FAILED {}: {}",
            file.name,
            file.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
