use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Vehicle identity
// ---------------------------------------------------------------------------

/// Canonical attributes of one vehicle. Immutable once a run starts;
/// callers fill in mileage/trim/options before running (registries don't
/// carry them).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleAttributes {
    pub brand: String,
    pub model: String,
    pub trim: Option<String>,
    pub build_year: Option<i32>,
    /// Kilometers. 0 = unknown.
    pub mileage_km: u32,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub body_type: Option<String>,
    pub power_hp: Option<u32>,
    pub color: Option<String>,
    pub options: Vec<String>,
}

impl VehicleAttributes {
    pub fn label(&self) -> String {
        match self.build_year {
            Some(year) => format!("{} {} ({year})", self.brand, self.model),
            None => format!("{} {}", self.brand, self.model),
        }
    }
}

/// Output of the free-text parser: attributes plus how sure we are and
/// which path produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedVehicle {
    pub attributes: VehicleAttributes,
    /// 0–1. The LLM path reports its own; the pattern fallback accumulates
    /// from a 0.3 base.
    pub confidence: f64,
    pub source: ParseSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseSource {
    Llm,
    Pattern,
}

// ---------------------------------------------------------------------------
// Marketplace comparables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparableListing {
    pub source: String,
    pub url: String,
    pub title: String,
    pub price: f64,
    pub mileage_km: Option<u32>,
    pub build_year: Option<i32>,
    pub color: Option<String>,
    pub options: Vec<String>,
    /// 0–1 similarity to the target vehicle.
    pub match_score: f64,
    /// Counts toward price statistics. Mutually exclusive with
    /// `is_deviation`.
    pub is_primary: bool,
    /// Price/mileage/year combination inconsistent with its peers.
    pub is_deviation: bool,
    pub deviation_reason: Option<String>,
}

/// Price statistics over one marketplace search. One per run.
/// `empty()` is the degraded form the rest of the pipeline prefers over a
/// hard failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalAnalysis {
    pub lowest_price: Option<f64>,
    pub median_price: Option<f64>,
    pub highest_price: Option<f64>,
    pub listing_count: usize,
    pub primary_count: usize,
    pub applied_filters: Vec<String>,
    pub listings: Vec<ComparableListing>,
    pub deviations: Vec<ComparableListing>,
    pub search_url: Option<String>,
}

impl PortalAnalysis {
    pub fn empty() -> Self {
        Self {
            lowest_price: None,
            median_price: None,
            highest_price: None,
            listing_count: 0,
            primary_count: 0,
            applied_filters: Vec::new(),
            listings: Vec::new(),
            deviations: Vec::new(),
            search_url: None,
        }
    }

    pub fn has_primaries(&self) -> bool {
        self.primary_count > 0
    }
}

// ---------------------------------------------------------------------------
// Pricing index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityClass {
    High,
    Medium,
    Low,
    Unknown,
}

impl LiquidityClass {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "high" | "hoog" => LiquidityClass::High,
            "medium" | "gemiddeld" => LiquidityClass::Medium,
            "low" | "laag" => LiquidityClass::Low,
            _ => LiquidityClass::Unknown,
        }
    }
}

impl std::fmt::Display for LiquidityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LiquidityClass::High => "high",
            LiquidityClass::Medium => "medium",
            LiquidityClass::Low => "low",
            LiquidityClass::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Third-party index valuation, forwarded unchanged. Absent entirely when
/// the plate is unknown to the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingIndexResult {
    pub base_value: f64,
    pub option_value: f64,
    pub total_value: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    /// 0–1.
    pub confidence: Option<f64>,
    /// Average Price Ratio, 0–1. Higher = priced further under market.
    pub apr: Option<f64>,
    /// Expected Time to Retail, days.
    pub etr_days: Option<i64>,
    pub liquidity: LiquidityClass,
}

// ---------------------------------------------------------------------------
// Internal sale history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    B2b,
    B2c,
}

impl Channel {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "b2b" => Channel::B2b,
            _ => Channel::B2c,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::B2b => write!(f, "b2b"),
            Channel::B2c => write!(f, "b2c"),
        }
    }
}

/// One historical sale, read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalComparableSale {
    pub brand: String,
    pub model: String,
    pub build_year: Option<i32>,
    pub mileage_km: Option<u32>,
    pub purchase_price: f64,
    pub selling_price: f64,
    pub margin_pct: f64,
    pub days_held: i64,
    pub channel: Channel,
    pub sold_date: Option<NaiveDate>,
}

/// How the internal comparable search matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    MatchedByModel,
    MatchedByBrandFallback,
    NoMatch,
}

impl std::fmt::Display for MatchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchTier::MatchedByModel => "matched_by_model",
            MatchTier::MatchedByBrandFallback => "matched_by_brand_fallback",
            MatchTier::NoMatch => "no_match",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalComparison {
    pub match_tier: MatchTier,
    pub avg_margin_pct: f64,
    pub avg_days_to_sell: i64,
    /// B2C only; B2B holding patterns differ structurally and are
    /// excluded from time-to-sell statistics.
    pub avg_days_to_sell_b2c: Option<i64>,
    pub b2b_count: usize,
    pub b2c_count: usize,
    pub widened_note: Option<String>,
    /// Up to 10 representative rows.
    pub sales: Vec<InternalComparableSale>,
}

impl InternalComparison {
    /// Fixed fallback when the sale-history query fails outright.
    /// Downstream synthesis must always receive a value here.
    pub fn conservative_default() -> Self {
        Self {
            match_tier: MatchTier::NoMatch,
            avg_margin_pct: crate::config::DEFAULT_MARGIN_PCT,
            avg_days_to_sell: crate::config::DEFAULT_DAYS_TO_SELL,
            avg_days_to_sell_b2c: None,
            b2b_count: 0,
            b2c_count: 0,
            widened_note: None,
            sales: Vec::new(),
        }
    }

    pub fn has_comparables(&self) -> bool {
        !self.sales.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Advice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    Buy,
    NoBuy,
    Uncertain,
}

impl Recommendation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "kopen" => Some(Recommendation::Buy),
            "no-buy" | "no_buy" | "nobuy" | "niet-kopen" => Some(Recommendation::NoBuy),
            "uncertain" | "onzeker" => Some(Recommendation::Uncertain),
            _ => None,
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Recommendation::Buy => "buy",
            Recommendation::NoBuy => "no-buy",
            Recommendation::Uncertain => "uncertain",
        };
        write!(f, "{s}")
    }
}

/// Terminal output of a valuation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationAdvice {
    /// None only when no concrete price signal existed; a price is never
    /// fabricated from zero signals.
    pub recommended_selling_price: Option<f64>,
    pub recommended_purchase_price: Option<f64>,
    pub expected_days_to_sell: i64,
    pub target_margin_pct: f64,
    pub recommendation: Recommendation,
    pub reasoning: String,
    pub index_deviation: Option<String>,
    pub risk_factors: Vec<String>,
    pub opportunities: Vec<String>,
    /// How many primary listings fed the computation (auditability).
    pub primary_listing_count: usize,
}

/// Everything one completed run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuationReport {
    pub plate: Option<String>,
    pub attributes: VehicleAttributes,
    pub portal: Option<PortalAnalysis>,
    pub index: Option<PricingIndexResult>,
    pub internal: InternalComparison,
    pub advice: ValuationAdvice,
    pub search_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Bulk rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkRowStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl std::fmt::Display for BulkRowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BulkRowStatus::Pending => "pending",
            BulkRowStatus::Processing => "processing",
            BulkRowStatus::Completed => "completed",
            BulkRowStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One supplier row in a bulk batch. Mutated in place; terminal at
/// completed/error; never auto-retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRow {
    pub index: usize,
    pub raw_description: String,
    pub plate: Option<String>,
    pub parsed: Option<ParsedVehicle>,
    pub status: BulkRowStatus,
    pub error: Option<String>,
    pub report: Option<ValuationReport>,
}

impl BulkRow {
    pub fn pending(index: usize, raw_description: String) -> Self {
        Self {
            index,
            raw_description,
            plate: None,
            parsed: None,
            status: BulkRowStatus::Pending,
            error: None,
            report: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkProgress {
    pub processed: usize,
    pub total: usize,
    pub current_label: String,
}
