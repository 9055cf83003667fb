use std::path::PathBuf;

use anyhow::{Context, Result};
use carid_core::{BlockId, FieldKey};
use carid_extract::resolve;
use carid_sync::{report_runs_markdown, IngestPipeline, PageInput, RuleSet, SyncConfig};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "carid-cli")]
#[command(about = "Car listing extraction and identity resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest HTML pages or JSON block files, then write reports and snapshots.
    Ingest {
        #[arg(long)]
        site: String,
        /// Base URL for resolving relative links in HTML pages.
        #[arg(long)]
        base_url: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print every candidate a field's patterns find in `text`.
    Scan {
        #[arg(long, value_parser = parse_field)]
        field: FieldKey,
        text: String,
    },
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn parse_field(raw: &str) -> Result<FieldKey, String> {
    FieldKey::parse(raw).ok_or_else(|| {
        let known = FieldKey::ALL
            .iter()
            .map(FieldKey::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        format!("unknown field `{raw}`; expected one of {known}")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Ingest {
            site,
            base_url,
            files,
        } => {
            let pipeline = IngestPipeline::new(config)?;
            let mut pages = Vec::with_capacity(files.len());
            for file in &files {
                let mut page = PageInput::from_path(&site, file).await?;
                if let Some(base) = &base_url {
                    page = page.with_base_url(base.clone());
                }
                pages.push(page);
            }
            let summary = pipeline.run(pages).await?;
            let run_dir = pipeline.write_run_report(&summary).await?;
            let manifest = pipeline.export_snapshots(&run_dir).await?;
            info!(run_id = %summary.run_id, "reports written");
            println!(
                "ingest complete: run_id={} ads={} failed={} vehicles={} pending={} reports={} manifest={}",
                summary.run_id,
                summary.ingested,
                summary.failed,
                summary.active_vehicles,
                summary.pending_reviews,
                run_dir.display(),
                manifest.display()
            );
        }
        Commands::Scan { field, text } => {
            let rules = RuleSet::load(&config).context("loading rules")?;
            let candidates = rules.patterns.scan(&text, field, BlockId(0));
            let resolved = resolve(field, &candidates);
            for candidate in resolved.winner.iter().chain(&resolved.alternates) {
                println!(
                    "{:.3}  {:<24} [{}] {:?} -> {:?}{}",
                    candidate.score,
                    candidate.pattern_id,
                    candidate.language.as_str(),
                    candidate.raw,
                    candidate.value,
                    candidate
                        .unit
                        .map(|u| format!(" {}", u.as_str()))
                        .unwrap_or_default()
                );
            }
            match resolved.winner {
                Some(winner) => println!("resolved {field}: {:?}", winner.value),
                None => println!("resolved {field}: null"),
            }
        }
        Commands::Report { runs } => {
            let markdown = report_runs_markdown(runs, &config.reports_dir)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
