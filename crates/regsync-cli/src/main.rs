use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regsync_sync::{SyncConfig, SyncRunSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "regsync")]
#[command(about = "Sync property status spreadsheets and schedules into Notion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert every workbook row into the database.
    Sync {
        workbook: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a hand-off file of mapped properties without contacting Notion.
    Export { workbook: PathBuf, out: PathBuf },
    /// Apply a hand-off file written by `export`.
    Apply {
        handoff: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the staffing report for an ICS calendar export.
    Schedule { ics: PathBuf },
    /// Show the database schema and any mismatches with the mapped properties.
    Schema,
    /// List addresses held by more than one page in the database.
    Duplicates,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { workbook, dry_run } => {
            let config = SyncConfig::from_env()?;
            let summary = regsync_sync::sync_workbook(&config, &workbook, dry_run).await?;
            print_run_summary(&summary);
        }
        Commands::Export { workbook, out } => {
            let summary = regsync_sync::export_workbook(&workbook, &out).await?;
            println!(
                "export complete: entries={} path={} sha256={} bytes={}",
                summary.entries, summary.path, summary.sha256, summary.bytes
            );
        }
        Commands::Apply { handoff, dry_run } => {
            let config = SyncConfig::from_env()?;
            let summary = regsync_sync::apply_handoff(&config, &handoff, dry_run).await?;
            print_run_summary(&summary);
        }
        Commands::Schedule { ics } => {
            let events = regsync_adapters::read_ics_file(&ics)
                .with_context(|| format!("reading calendar {}", ics.display()))?;
            println!("{}", regsync_sync::schedule_report(&events));
        }
        Commands::Schema => {
            let config = SyncConfig::from_env()?;
            let report = regsync_sync::check_schema(&config).await?;
            println!("{}", regsync_sync::render_schema_report(&report));
        }
        Commands::Duplicates => {
            let config = SyncConfig::from_env()?;
            let report = regsync_sync::find_duplicates(&config).await?;
            println!("{}", regsync_sync::render_duplicate_report(&report));
        }
    }

    Ok(())
}

fn print_run_summary(summary: &SyncRunSummary) {
    if summary.dry_run {
        println!(
            "dry run: run_id={} rows={} would_update={} would_create={} skipped={} remote_pages={}",
            summary.run_id,
            summary.total,
            summary.plan.updates,
            summary.plan.creates,
            summary.plan.skipped,
            summary.remote_pages
        );
    } else {
        println!(
            "sync complete: run_id={} rows={} updated={} created={} errors={} remote_pages={}",
            summary.run_id,
            summary.total,
            summary.updated,
            summary.created,
            summary.errors,
            summary.remote_pages
        );
    }
    if let Some(status) = summary.listing_truncated {
        println!("warning: remote listing stopped early (HTTP {status}); some rows may have been created as duplicates");
    }
}
