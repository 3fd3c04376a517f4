use crate::error::{AppError, Result};

pub const REGISTRY_URL: &str = "https://opendata.rdw.nl";
pub const PRICING_INDEX_URL: &str = "https://api.autotelex.nl";
pub const LLM_URL: &str = "http://localhost:11434";
pub const LLM_MODEL: &str = "llama3:8b";
pub const MARKETPLACE_URL: &str = "https://www.gaspedaal.nl";

/// Maximum descriptions handed to the LLM extraction pass in one call.
/// Larger batches are chunked by the bulk orchestrator.
pub const PARSER_CHUNK_SIZE: usize = 20;

/// Maximum listings the search agent is asked to return per portal page.
pub const MAX_LISTINGS_PER_SEARCH: usize = 15;

/// Representative sales carried inside an InternalComparison.
pub const MAX_REPRESENTATIVE_SALES: usize = 10;

/// Fewer than this many usable model-level rows triggers the brand-level
/// widened search.
pub const WIDEN_THRESHOLD: usize = 2;

/// Lookback window for internal comparable sales (days).
pub const INTERNAL_LOOKBACK_DAYS: i64 = 365;

/// Days-to-sell clamp bounds and the default applied when a purchase or
/// sold date is missing.
pub const DAYS_TO_SELL_MIN: i64 = 1;
pub const DAYS_TO_SELL_MAX: i64 = 365;
pub const DEFAULT_DAYS_TO_SELL: i64 = 21;

/// Conservative margin assumed when internal history yields nothing.
pub const DEFAULT_MARGIN_PCT: f64 = 18.0;

/// Flat reconditioning/transport allowance subtracted from the recommended
/// purchase price after the margin step (euros).
pub const SALES_PREP_ALLOWANCE_EUR: f64 = 500.0;

/// Recommendation thresholds. Fewer than `MIN_SIGNALS_FOR_VERDICT` live
/// price signals always yields `uncertain`. A buy verdict requires the
/// margin and retail-time cutoffs below; the band between buy and no-buy
/// stays `uncertain`.
pub mod verdict_thresholds {
    pub const MIN_SIGNALS_FOR_VERDICT: usize = 2;
    pub const BUY_MIN_MARGIN_PCT: f64 = 12.0;
    pub const BUY_MAX_ETR_DAYS: i64 = 45;
    pub const NO_BUY_MAX_MARGIN_PCT: f64 = 8.0;
    pub const NO_BUY_MIN_ETR_DAYS: i64 = 90;
}

/// The LLM reasoning pass may adjust prices only within this fraction of
/// the deterministic baseline; anything outside is clamped.
pub const LLM_PRICE_CLAMP_PCT: f64 = 0.15;

/// Base confidence for the deterministic free-text fallback parse, the
/// increment per matched field family, and the cap.
pub const FALLBACK_CONFIDENCE_BASE: f64 = 0.3;
pub const FALLBACK_CONFIDENCE_STEP: f64 = 0.15;
pub const FALLBACK_CONFIDENCE_CAP: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct Config {
    pub registry_url: String,
    pub pricing_index_url: String,
    pub llm_url: String,
    pub llm_model: String,
    pub marketplace_url: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Rows processed concurrently in a bulk batch (BULK_CONCURRENCY).
    /// Kept small to avoid rate-limiting the search agent and index calls.
    pub bulk_concurrency: usize,
    /// Capacity of the LRU cache over recent portal searches.
    pub search_cache_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            registry_url: std::env::var("REGISTRY_URL")
                .unwrap_or_else(|_| REGISTRY_URL.to_string()),
            pricing_index_url: std::env::var("PRICING_INDEX_URL")
                .unwrap_or_else(|_| PRICING_INDEX_URL.to_string()),
            llm_url: std::env::var("LLM_URL").unwrap_or_else(|_| LLM_URL.to_string()),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| LLM_MODEL.to_string()),
            marketplace_url: std::env::var("MARKETPLACE_URL")
                .unwrap_or_else(|_| MARKETPLACE_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "valuator.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            bulk_concurrency: std::env::var("BULK_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse::<usize>()
                .unwrap_or(2)
                .max(1),
            search_cache_capacity: std::env::var("SEARCH_CACHE_CAPACITY")
                .unwrap_or_else(|_| "64".to_string())
                .parse::<usize>()
                .unwrap_or(64)
                .max(1),
        })
    }
}
