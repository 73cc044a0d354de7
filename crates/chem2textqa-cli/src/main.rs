//! chem2textqa: scrape papers and patents into line-delimited JSON.
//! Entry point for the command-line binary.

mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chem2textqa_common::SourceType;
use chem2textqa_ingestion::pipeline::{SourceBatch, SourceStatus, SourceSummary};
use chem2textqa_ingestion::store::{append_documents, count_documents};
use chem2textqa_ingestion::{Orchestrator, SearchQuery, SourceSelection};

use config::Config;

#[derive(Parser)]
#[command(name = "chem2textqa", version, about = "Scrape PubMed and patent offices into JSONL")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search one or more sources and append the results to JSONL files
    Scrape(ScrapeArgs),
    /// Count the documents in a JSONL file
    Count {
        file: PathBuf,
    },
    /// Show configuration and the available sources
    Info,
}

#[derive(clap::Args)]
struct ScrapeArgs {
    /// Source tag, comma-separated tags, or `all`
    #[arg(short, long, default_value = "all")]
    source: String,
    #[arg(short, long)]
    query: String,
    /// Per-source result limit (defaults to the configured default_limit)
    #[arg(short = 'n', long)]
    max_results: Option<usize>,
    /// Earliest publication/priority date, YYYY-MM-DD
    #[arg(long)]
    date_from: Option<NaiveDate>,
    /// Latest publication/priority date, YYYY-MM-DD
    #[arg(long)]
    date_to: Option<NaiveDate>,
    /// Single output file for every source, instead of <output_dir>/<source>.jsonl
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    match cli.command {
        Command::Scrape(args) => scrape(&config, args).await,
        Command::Count { file } => {
            let n = count_documents(&file).await?;
            println!("{} documents in {}", n, file.display());
            Ok(())
        }
        Command::Info => {
            print_info(&config);
            Ok(())
        }
    }
}

fn output_path(config: &Config, explicit: Option<&Path>, source: SourceType) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.output_dir.join(format!("{}.jsonl", source)))
}

async fn scrape(config: &Config, args: ScrapeArgs) -> anyhow::Result<()> {
    let selection: SourceSelection = args.source.parse()?;
    let query = SearchQuery::new(&args.query).with_dates(args.date_from, args.date_to);
    let limit = args.max_results.unwrap_or(config.scraper.default_limit);
    let orchestrator = Orchestrator::from_settings(&config.scraper)?;

    info!(query = %query.text, limit, "Starting scrape");
    let (tx, mut rx) = mpsc::channel::<SourceBatch>(4);

    // Each batch is appended as soon as its source finishes
    let persist = async {
        let mut summaries: Vec<SourceSummary> = Vec::new();
        let mut total = 0;
        while let Some(batch) = rx.recv().await {
            let path = output_path(config, args.output.as_deref(), batch.summary.source);
            let written = append_documents(&path, &batch.documents)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            total += written;
            print_summary(&batch.summary, written, &path);
            summaries.push(batch.summary);
        }
        Ok::<_, anyhow::Error>((summaries, total))
    };
    let run = async {
        let (produced, persisted) = tokio::join!(orchestrator.scrape_into(&selection, &query, limit, tx), persist);
        produced?;
        persisted
    };

    tokio::select! {
        outcome = run => {
            let (summaries, total) = outcome?;
            let failed = summaries.iter().filter(|s| s.is_failed()).count();
            println!("Total: {} documents from {} source(s), {} failed", total, summaries.len(), failed);
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; batches already written are kept");
        }
    }
    Ok(())
}

fn print_summary(summary: &SourceSummary, written: usize, path: &Path) {
    match &summary.status {
        SourceStatus::Fetched { skipped, duplicates, .. } => println!(
            "{:<15} {:>5} documents ({} skipped, {} duplicates) in {} ms -> {}",
            summary.source,
            written,
            skipped,
            duplicates,
            summary.duration_ms,
            path.display()
        ),
        SourceStatus::Failed { kind, reason } => {
            println!("{:<15} FAILED {}: {}", summary.source, kind, reason)
        }
    }
}

fn print_info(config: &Config) {
    let s = &config.scraper;
    let presence = |set: bool| if set { "set" } else { "missing" };

    println!("Config file:    {}", Config::path().display());
    println!("Output dir:     {}", config.output_dir.display());
    println!("Log level:      {}", config.log_level);
    println!("Default limit:  {}", s.default_limit);
    println!();
    println!("Sources:");
    println!(
        "  {:<15} NCBI_API_KEY {} ({} req/s), email {}",
        SourceType::PubMed,
        presence(s.ncbi_api_key.is_some()),
        s.ncbi_rate_limit(),
        s.ncbi_email
    );
    println!(
        "  {:<15} SERPAPI_KEY {} ({})",
        SourceType::GooglePatents,
        presence(s.serpapi_key.is_some()),
        if s.serpapi_key.is_some() { "SerpAPI" } else { "HTML scrape" }
    );
    println!(
        "  {:<15} USPTO_API_KEY {} (required)",
        SourceType::Uspto,
        presence(s.uspto_api_key.is_some())
    );
    println!(
        "  {:<15} EPO_KEY {}, EPO_SECRET {} (both required)",
        SourceType::Epo,
        presence(s.epo_key.is_some()),
        presence(s.epo_secret.is_some())
    );
}
