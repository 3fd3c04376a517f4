//! Bulk import CLI: one supplier description per line in, a color-coded
//! XLSX valuation sheet out.
//!
//! Usage: `bulk-import <input.txt> [output.xlsx]`

use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use acquisition_valuator::bulk::BulkOrchestrator;
use acquisition_valuator::config::Config;
use acquisition_valuator::db;
use acquisition_valuator::error::{AppError, Result};
use acquisition_valuator::export::export_batch;
use acquisition_valuator::pipeline::Services;
use acquisition_valuator::types::{BulkRowStatus, Recommendation};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let mut args = std::env::args().skip(1);
    let input = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| AppError::Config("usage: bulk-import <input.txt> [output.xlsx]".into()))?;
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| input.with_extension("xlsx"));

    let descriptions: Vec<String> = std::fs::read_to_string(&input)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if descriptions.is_empty() {
        return Err(AppError::Config(format!(
            "{} contains no usable rows",
            input.display()
        )));
    }

    let pool = db::connect(&cfg.db_path).await?;
    let services = Services::from_config(&cfg, pool)?;
    let orchestrator = BulkOrchestrator::new(services, cfg.bulk_concurrency);

    let batch = orchestrator.ingest(descriptions);
    info!(rows = batch.progress().total, "processing batch");
    orchestrator.process(&batch).await;

    let rows = batch.rows();
    let bytes = export_batch(&rows)?;
    std::fs::write(&output, bytes)?;

    let mut buy = 0;
    let mut no_buy = 0;
    let mut uncertain = 0;
    let mut errors = 0;
    for row in &rows {
        match (&row.status, &row.report) {
            (BulkRowStatus::Completed, Some(report)) => match report.advice.recommendation {
                Recommendation::Buy => buy += 1,
                Recommendation::NoBuy => no_buy += 1,
                Recommendation::Uncertain => uncertain += 1,
            },
            _ => errors += 1,
        }
    }

    println!("Batch of {} rows processed:", rows.len());
    println!("  buy:       {buy}");
    println!("  no-buy:    {no_buy}");
    println!("  uncertain: {uncertain}");
    println!("  errors:    {errors}");
    println!("Sheet written to {}", output.display());
    Ok(())
}
