use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use acquisition_valuator::api::routes::{router, ApiState};
use acquisition_valuator::config::Config;
use acquisition_valuator::db;
use acquisition_valuator::db::advice_writer::save_advice;
use acquisition_valuator::error::Result;
use acquisition_valuator::pipeline::{Services, ValuationRun};
use acquisition_valuator::types::ValuationReport;

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

/// `valuator <plate> [mileage] [--save]` runs one valuation and prints
/// the advice; without arguments the HTTP API is served instead.
async fn run(cfg: Config) -> Result<()> {
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let services = Services::from_config(&cfg, pool.clone())?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let save = args.iter().any(|a| a == "--save");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    if let Some(plate) = positional.first() {
        let mileage = positional
            .get(1)
            .and_then(|m| m.parse::<u32>().ok())
            .unwrap_or(0);

        let mut run = ValuationRun::new(Arc::clone(&services));
        let report = run.run(plate.as_str(), mileage).await?;
        print_report(&report);

        if save {
            let id = save_advice(&pool, &report).await?;
            info!(advice_id = id, "advice saved");
        }
        return Ok(());
    }

    let state = ApiState::new(services, pool, cfg.bulk_concurrency);
    let app = router(state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

fn print_report(report: &ValuationReport) {
    let advice = &report.advice;
    println!("{}", report.attributes.label());
    if report.attributes.mileage_km > 0 {
        println!("  mileage:            {} km", report.attributes.mileage_km);
    }
    println!("  recommendation:     {}", advice.recommendation);
    match advice.recommended_purchase_price {
        Some(price) => println!("  purchase up to:     € {price:.0}"),
        None => println!("  purchase up to:     no price signal available"),
    }
    if let Some(price) = advice.recommended_selling_price {
        println!("  expected sale:      € {price:.0}");
    }
    println!(
        "  days to sell:       {} | target margin: {:.1}%",
        advice.expected_days_to_sell, advice.target_margin_pct
    );
    if let Some(index) = &report.index {
        let apr = index
            .apr
            .map(|a| format!("{a:.2}"))
            .unwrap_or_else(|| "n/a".into());
        println!(
            "  pricing index:      € {:.0} | APR {} | liquidity {}",
            index.total_value, apr, index.liquidity
        );
    }
    if let Some(portal) = &report.portal {
        if portal.has_primaries() {
            println!(
                "  marketplace:        {} primary listings, median € {:.0}",
                portal.primary_count,
                portal.median_price.unwrap_or(0.0)
            );
        }
    }
    if let Some(note) = &report.internal.widened_note {
        println!("  note:               {note}");
    }
    println!("  reasoning:          {}", advice.reasoning);
    for risk in &advice.risk_factors {
        println!("  risk:               {risk}");
    }
    for opportunity in &advice.opportunities {
        println!("  opportunity:        {opportunity}");
    }
    if let Some(url) = &report.search_url {
        println!("  search url:         {url}");
    }
}
