use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lotwatch_pipeline::PipelineConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lotwatch")]
#[command(about = "Competitor inventory tracking pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled target once and write a report.
    Run {
        /// Override the targets registry file from the environment config.
        #[arg(long)]
        targets: Option<PathBuf>,
    },
    /// Print the most recent run reports.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { targets: None }) {
        Commands::Run { targets } => {
            if let Some(path) = targets {
                config.targets_file = path;
            }
            let report = lotwatch_pipeline::run_once(&config).await?;
            println!(
                "run complete: report_id={} targets={} outcome=\"{}\"",
                report.report_id,
                report.total_targets,
                report.one_line()
            );
        }
        Commands::Report { runs } => {
            let markdown = lotwatch_pipeline::report_recent_markdown(runs, &config.reports_dir)?;
            println!("{markdown}");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let scheduler = lotwatch_pipeline::maybe_build_scheduler(&config)
                .await?
                .context("scheduler was not built despite being enabled")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.cron_schedule, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
