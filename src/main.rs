use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use docbatch::config::{Config, CONFIG_ENV, DEFAULT_CONFIG_PATH};
use docbatch::progress::format_duration;
use docbatch::{pipeline, Pipeline, RunReport};

#[derive(Parser)]
#[command(
    name = "docbatch",
    about = "Bounded-concurrency document batch processor",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform every discovered document and record the outcomes
    Run {
        /// Override the configured worker count
        #[arg(long)]
        concurrency: Option<usize>,

        /// JSON summary for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Copy all locally recorded outcomes into the remote store
    CatchUp {
        /// Override the configured page size
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Create the local outcome table if it does not exist
    InitDb,

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    docbatch::logging::init(&config.logging)?;
    tracing::info!(path = %cli.config.display(), "configuration loaded");

    match cli.command {
        Commands::Run { concurrency, json } => {
            if let Some(n) = concurrency {
                config.concurrency = n;
                config.validate()?;
            }
            let pipeline = Pipeline::from_config(config)?;
            let report = pipeline.run().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
        }
        Commands::CatchUp { page_size } => {
            if let Some(n) = page_size {
                config.remote_sync.page_size = n;
                config.validate()?;
            }
            tracing::info!(location = %config.local_sink.location.display(), "starting catch-up sync");
            let report = pipeline::catch_up(&config).await?;
            println!(
                "Catch-up complete: {} rows sent, {} new, {} pages committed.",
                report.rows, report.inserted, report.commits
            );
        }
        Commands::InitDb => {
            pipeline::init_local(&config)
                .await
                .with_context(|| format!("failed to initialise {}", config.local_sink.location.display()))?;
            println!("Local sink ready at {}.", config.local_sink.location.display());
        }
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
    }

    Ok(())
}

fn print_summary(report: &RunReport) {
    let s = &report.summary;
    println!("\n=== Processing summary ===");
    println!("Batch:          {}", report.batch_id);
    println!("Total files:    {}", s.total_files);
    println!("Processed:      {}", s.processed_files);
    println!("Successful:     {}", s.successful);
    println!("Failed:         {}", s.failed);
    println!("Elapsed:        {}", format_duration(s.elapsed_seconds));
    println!("Average/file:   {:.2} ms", s.avg_ms_per_file);

    match (&report.local_inserted, &report.local_error) {
        (Some(n), _) => println!("Local sink:     {} rows written", n),
        (None, Some(e)) => println!("Local sink:     FAILED ({})", e),
        (None, None) => {}
    }
    match (&report.remote, &report.remote_error) {
        (Some(r), _) => println!("Remote sync:    {} rows in {} commits", r.rows, r.commits),
        (None, Some(e)) => println!("Remote sync:    FAILED ({})", e),
        (None, None) => {}
    }
    println!();
}
