//! Internal comparables engine: historical-sale statistics with a
//! widening fallback (model-level, then brand-level).

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::config::{
    DAYS_TO_SELL_MAX, DAYS_TO_SELL_MIN, DEFAULT_DAYS_TO_SELL, INTERNAL_LOOKBACK_DAYS,
    MAX_REPRESENTATIVE_SALES, WIDEN_THRESHOLD,
};
use crate::db::sales::{SaleRow, SalesRepo};
use crate::types::{Channel, InternalComparableSale, InternalComparison, MatchTier, VehicleAttributes};

#[derive(Clone)]
pub struct InternalEngine {
    repo: SalesRepo,
}

impl InternalEngine {
    pub fn new(repo: SalesRepo) -> Self {
        Self { repo }
    }

    /// Compare against internal sale history. Never fails: a total query
    /// failure degrades to the fixed conservative default so synthesis
    /// always receives a value.
    pub async fn compare(&self, attrs: &VehicleAttributes) -> InternalComparison {
        let since = (Utc::now().date_naive() - chrono::Duration::days(INTERNAL_LOOKBACK_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        let prefix = model_prefix(&attrs.model);

        let model_rows = match self
            .repo
            .sold_by_brand_and_model_prefix(&attrs.brand, &prefix, &since)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("internal comparables query failed, using conservative default: {e}");
                return InternalComparison::conservative_default();
            }
        };

        let usable: Vec<InternalComparableSale> =
            model_rows.iter().filter_map(to_comparable).collect();
        if usable.len() >= WIDEN_THRESHOLD {
            debug!(count = usable.len(), "internal comparables matched by model");
            return build_comparison(MatchTier::MatchedByModel, usable, None);
        }

        // Fewer than 2 usable model-level rows: widen to brand only.
        let brand_rows = match self.repo.sold_by_brand(&attrs.brand, &since).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("widened comparables query failed, using conservative default: {e}");
                return InternalComparison::conservative_default();
            }
        };
        let widened: Vec<InternalComparableSale> =
            brand_rows.iter().filter_map(to_comparable).collect();

        if widened.is_empty() {
            let mut cmp = InternalComparison::conservative_default();
            cmp.widened_note = Some(format!(
                "No sales of {} {} in the last 12 months; the widened brand search \
                 found nothing either.",
                attrs.brand, attrs.model
            ));
            return cmp;
        }

        debug!(count = widened.len(), "internal comparables widened to brand level");
        let note = format!(
            "Too few {} {} sales; statistics are based on all {} sales in the \
             last 12 months.",
            attrs.brand, attrs.model, attrs.brand
        );
        build_comparison(MatchTier::MatchedByBrandFallback, widened, Some(note))
    }
}

/// First two words of the model, which tolerates trim suffixes:
/// "Golf GTI Performance" matches rows stored as "Golf GTI ...".
pub fn model_prefix(model: &str) -> String {
    model
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// margin = (sell − buy) / buy × 100. A non-positive purchase price makes
/// the row unusable.
pub fn margin_pct(purchase_price: f64, selling_price: f64) -> Option<f64> {
    if purchase_price <= 0.0 {
        return None;
    }
    Some((selling_price - purchase_price) / purchase_price * 100.0)
}

/// Whole days between purchase and sold dates, clamped to [1, 365].
/// Either date missing → the 21-day default.
pub fn days_to_sell(purchase_date: Option<NaiveDate>, sold_date: Option<NaiveDate>) -> i64 {
    match (purchase_date, sold_date) {
        (Some(bought), Some(sold)) => {
            (sold - bought).num_days().clamp(DAYS_TO_SELL_MIN, DAYS_TO_SELL_MAX)
        }
        _ => DEFAULT_DAYS_TO_SELL,
    }
}

fn parse_date(s: Option<&str>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn to_comparable(row: &SaleRow) -> Option<InternalComparableSale> {
    let purchase_price = row.purchase_price?;
    let selling_price = row.selling_price?;
    let margin = margin_pct(purchase_price, selling_price)?;
    let bought = parse_date(row.purchase_date.as_deref());
    let sold = parse_date(row.sold_date.as_deref());

    Some(InternalComparableSale {
        brand: row.brand.clone(),
        model: row.model.clone(),
        build_year: row.build_year.map(|y| y as i32),
        mileage_km: row.mileage.map(|m| m as u32),
        purchase_price,
        selling_price,
        margin_pct: margin,
        days_held: days_to_sell(bought, sold),
        channel: Channel::parse(&row.channel),
        sold_date: sold,
    })
}

fn build_comparison(
    tier: MatchTier,
    sales: Vec<InternalComparableSale>,
    widened_note: Option<String>,
) -> InternalComparison {
    let n = sales.len() as f64;
    let avg_margin = sales.iter().map(|s| s.margin_pct).sum::<f64>() / n;
    let avg_days =
        (sales.iter().map(|s| s.days_held as f64).sum::<f64>() / n).round() as i64;

    // B2B holding patterns differ structurally; keep them out of the
    // time-to-sell statistics.
    let b2c: Vec<&InternalComparableSale> =
        sales.iter().filter(|s| s.channel == Channel::B2c).collect();
    let avg_days_b2c = if b2c.is_empty() {
        None
    } else {
        Some(
            (b2c.iter().map(|s| s.days_held as f64).sum::<f64>() / b2c.len() as f64).round()
                as i64,
        )
    };

    let b2b_count = sales.len() - b2c.len();
    let b2c_count = b2c.len();

    let mut representative = sales;
    representative.truncate(MAX_REPRESENTATIVE_SALES);

    InternalComparison {
        match_tier: tier,
        avg_margin_pct: avg_margin,
        avg_days_to_sell: avg_days,
        avg_days_to_sell_b2c: avg_days_b2c,
        b2b_count,
        b2c_count,
        widened_note,
        sales: representative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_memory;
    use crate::db::sales::insert_sale;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn margin_is_deterministic() {
        assert_eq!(margin_pct(10_000.0, 11_600.0), Some(16.0));
        assert_eq!(margin_pct(10_000.0, 9_000.0), Some(-10.0));
        assert_eq!(margin_pct(0.0, 9_000.0), None);
    }

    #[test]
    fn days_to_sell_clamps_and_defaults() {
        assert_eq!(days_to_sell(Some(date("2026-01-01")), Some(date("2026-01-15"))), 14);
        // same day clamps up to 1
        assert_eq!(days_to_sell(Some(date("2026-01-01")), Some(date("2026-01-01"))), 1);
        // sold before bought (data entry noise) clamps up to 1
        assert_eq!(days_to_sell(Some(date("2026-01-15")), Some(date("2026-01-01"))), 1);
        // two years clamps down to 365
        assert_eq!(days_to_sell(Some(date("2024-01-01")), Some(date("2026-01-01"))), 365);
        // missing date → default
        assert_eq!(days_to_sell(None, Some(date("2026-01-01"))), 21);
        assert_eq!(days_to_sell(Some(date("2026-01-01")), None), 21);
    }

    #[test]
    fn model_prefix_takes_first_two_words() {
        assert_eq!(model_prefix("Golf"), "Golf");
        assert_eq!(model_prefix("Golf GTI Performance DSG"), "Golf GTI");
        assert_eq!(model_prefix("  3 Series  Touring "), "3 Series");
    }

    async fn engine_with_pool() -> (InternalEngine, sqlx::SqlitePool) {
        let pool = connect_memory().await.unwrap();
        let engine = InternalEngine::new(SalesRepo::new(pool.clone()));
        (engine, pool)
    }

    fn attrs(brand: &str, model: &str) -> VehicleAttributes {
        VehicleAttributes {
            brand: brand.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    fn recent(days_ago: i64) -> String {
        (Utc::now().date_naive() - chrono::Duration::days(days_ago))
            .format("%Y-%m-%d")
            .to_string()
    }

    #[tokio::test]
    async fn model_level_match_with_enough_rows() {
        let (engine, pool) = engine_with_pool().await;
        let sold = recent(10);
        let bought = recent(40);
        insert_sale(&pool, "Volkswagen", "Golf GTI", Some(15_000.0), Some(17_400.0),
            Some(&bought), Some(&sold), "b2c").await;
        insert_sale(&pool, "Volkswagen", "Golf", Some(14_000.0), Some(16_100.0),
            Some(&bought), Some(&sold), "b2c").await;
        insert_sale(&pool, "Volkswagen", "Passat", Some(18_000.0), Some(20_000.0),
            Some(&bought), Some(&sold), "b2b").await;

        let cmp = engine.compare(&attrs("Volkswagen", "Golf")).await;
        assert_eq!(cmp.match_tier, MatchTier::MatchedByModel);
        assert_eq!(cmp.sales.len(), 2);
        assert!(cmp.widened_note.is_none());
        assert_eq!(cmp.avg_days_to_sell, 30);
        assert_eq!(cmp.b2c_count, 2);
        assert_eq!(cmp.b2b_count, 0);
    }

    #[tokio::test]
    async fn one_usable_model_row_always_widens() {
        let (engine, pool) = engine_with_pool().await;
        let sold = recent(10);
        let bought = recent(40);
        insert_sale(&pool, "Volkswagen", "Golf", Some(15_000.0), Some(17_250.0),
            Some(&bought), Some(&sold), "b2c").await;
        insert_sale(&pool, "Volkswagen", "Polo", Some(9_000.0), Some(10_350.0),
            Some(&bought), Some(&sold), "b2c").await;
        insert_sale(&pool, "Volkswagen", "Tiguan", Some(22_000.0), Some(24_200.0),
            Some(&bought), Some(&sold), "b2b").await;

        let cmp = engine.compare(&attrs("Volkswagen", "Golf")).await;
        assert_eq!(cmp.match_tier, MatchTier::MatchedByBrandFallback);
        assert!(cmp.widened_note.is_some());
        assert_eq!(cmp.sales.len(), 3);
        assert_eq!(cmp.b2b_count, 1);
        assert_eq!(cmp.b2c_count, 2);
    }

    #[tokio::test]
    async fn b2b_excluded_from_b2c_time_statistics() {
        let (engine, pool) = engine_with_pool().await;
        let sold = recent(5);
        let bought_fast = recent(15); // 10 days held
        let bought_slow = recent(105); // 100 days held
        insert_sale(&pool, "BMW", "320i", Some(20_000.0), Some(23_000.0),
            Some(&bought_fast), Some(&sold), "b2c").await;
        insert_sale(&pool, "BMW", "320i", Some(21_000.0), Some(23_500.0),
            Some(&bought_slow), Some(&sold), "b2b").await;

        let cmp = engine.compare(&attrs("BMW", "320i")).await;
        assert_eq!(cmp.match_tier, MatchTier::MatchedByModel);
        assert_eq!(cmp.avg_days_to_sell_b2c, Some(10));
        // overall average still includes the b2b row
        assert_eq!(cmp.avg_days_to_sell, 55);
    }

    #[tokio::test]
    async fn empty_history_degrades_with_note() {
        let (engine, _pool) = engine_with_pool().await;
        let cmp = engine.compare(&attrs("Lancia", "Delta")).await;
        assert_eq!(cmp.match_tier, MatchTier::NoMatch);
        assert_eq!(cmp.avg_margin_pct, 18.0);
        assert_eq!(cmp.avg_days_to_sell, 21);
        assert!(cmp.widened_note.is_some());
        assert!(!cmp.has_comparables());
    }
}
