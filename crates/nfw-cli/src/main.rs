use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use nfw_core::{MarketType, ReportType};
use nfw_sync::{BackfillRequest, RunReport, SyncConfig, TargetFilter, TargetScope};
use tracing::level_filters::LevelFilter;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nfw")]
#[command(about = "Nusantara Food Watch price ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch everything since the last successful daily run.
    Incremental,
    /// Re-ingest an explicit date range.
    Backfill {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        /// `cat_N` or `com_N`; repeatable. Defaults to the whole catalog.
        #[arg(long = "commodity")]
        commodities: Vec<String>,
        /// Market type code (1-4) or name; repeatable.
        #[arg(long = "market-type")]
        market_types: Vec<MarketType>,
        #[arg(long, default_value = "daily")]
        report_type: ReportType,
        #[arg(long, conflicts_with = "subcategories_only")]
        categories_only: bool,
        #[arg(long)]
        subcategories_only: bool,
    },
    Migrate,
    Seed,
    Stats,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Incremental)).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = SyncConfig::from_env();

    match command {
        Commands::Incremental => {
            let today = config.today(Utc::now());
            let pipeline = nfw_sync::pipeline_from_config(config).await?;
            cancel_on_ctrl_c(pipeline.cancel_signal());
            let report = pipeline.run_incremental(today).await?;
            Ok(finish(&report))
        }
        Commands::Backfill {
            start,
            end,
            commodities,
            market_types,
            report_type,
            categories_only,
            subcategories_only,
        } => {
            let scope = if categories_only {
                TargetScope::CategoriesOnly
            } else if subcategories_only {
                TargetScope::SubcategoriesOnly
            } else {
                TargetScope::All
            };
            let request = BackfillRequest {
                start,
                end,
                report_type,
                filter: TargetFilter {
                    codes: commodities,
                    scope,
                },
                market_types,
            };
            request.window()?;

            let pipeline = nfw_sync::pipeline_from_config(config).await?;
            cancel_on_ctrl_c(pipeline.cancel_signal());
            let report = pipeline.run_backfill(&request).await?;
            Ok(finish(&report))
        }
        Commands::Migrate => {
            let warehouse = nfw_warehouse::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to warehouse")?;
            warehouse.migrate().await.context("running migrations")?;
            println!("migrations applied ({})", warehouse.backend());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Seed => {
            let pipeline = nfw_sync::pipeline_from_config(config).await?;
            let summary = pipeline.seed().await?;
            println!(
                "seeded: provinces={} commodities={} subcategories={} market_types={}",
                summary.provinces, summary.commodities, summary.subcategories, summary.market_types
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let warehouse = nfw_warehouse::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to warehouse")?;
            let stats = warehouse.stats().await.context("reading warehouse stats")?;
            println!("{}", stats.to_markdown());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { runs } => {
            println!(
                "{}",
                nfw_sync::report_recent_markdown(runs, &config.reports_dir)?
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cancel_on_ctrl_c(signal: nfw_sync::CancelSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight tuples");
            signal.cancel();
        }
    });
}

fn finish(report: &RunReport) -> ExitCode {
    println!(
        "run complete: run_id={} status={} done={} empty={} failed={} inserted={} updated={} rejected={}",
        report.run_id,
        report.status().as_str(),
        report.tuples_done,
        report.tuples_empty,
        report.tuples_failed,
        report.inserted,
        report.updated,
        report.rejected
    );
    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
