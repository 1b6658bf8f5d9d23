use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use csv::ReaderBuilder;
use surveillance_ingest::logging::init_tracing;
use surveillance_ingest::progress::TracingProgress;
use surveillance_ingest::store::memory::MemoryStore;
use surveillance_ingest::store::postgres::PgStore;
use surveillance_ingest::store::Store;
use surveillance_ingest::util::db::Db;
use surveillance_ingest::util::env::{db_url, env_parse, init_env};
use surveillance_ingest::{Batch, IngestConfig, IngestPlan, Orchestrator};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "ingest_batch",
    version,
    about = "Load one surveillance extract (CSV) into the case store"
)]
struct Cli {
    /// CSV file with a header row; column names follow the extract layout
    #[arg(long)]
    file: PathBuf,
    /// Concurrent detail operations (defaults to INGEST_WORKERS or 4)
    #[arg(long)]
    workers: Option<usize>,
    /// Keep foreign-key enforcement on during the load
    #[arg(long = "no-suspend-fk", action = ArgAction::SetTrue)]
    no_suspend_fk: bool,
    /// Run against an in-memory store instead of DATABASE_URL
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
}

fn read_batch(path: &Path) -> Result<Batch> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::with_capacity(8 << 20, file));

    let headers: Vec<String> = rdr
        .headers()
        .context("read csv header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut records = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("csv record {}", line + 1))?;
        records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }
    Ok(Batch::from_records(&headers, records))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    let mut config = IngestConfig::from_env();
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers);
    }
    if cli.no_suspend_fk {
        config = config.with_suspended_referential_integrity(false);
    }

    let batch = read_batch(&cli.file)?;
    info!(rows = batch.len(), file = %cli.file.display(), "batch read");

    let store: Arc<dyn Store> = if cli.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let url = db_url()?;
        // one connection for the main session plus one per worker
        let default_max = (config.workers + 1) as u32;
        let max_connections = env_parse("DB_MAX_CONNECTIONS", default_max).max(default_max);
        Arc::new(PgStore::new(Db::connect(&url, max_connections).await?))
    };

    let summary = Orchestrator::new(store, IngestPlan::surveillance(), config)
        .with_progress(TracingProgress)
        .run(batch)
        .await
        .context("batch ingest failed")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
