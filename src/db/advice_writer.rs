use sqlx::SqlitePool;

use crate::error::Result;
use crate::types::ValuationReport;

/// Persist a completed run's advice. Append-only; the explicit "save"
/// step after a run; nothing else in the pipeline writes shared state.
pub async fn save_advice(pool: &SqlitePool, report: &ValuationReport) -> Result<i64> {
    let advice = &report.advice;
    let attrs = &report.attributes;
    let recommendation = advice.recommendation.to_string();
    let created_at = chrono::Utc::now().to_rfc3339();

    let result = sqlx::query(
        "INSERT INTO advice (plate, brand, model, build_year, mileage, recommendation, \
         recommended_selling_price, recommended_purchase_price, expected_days_to_sell, \
         target_margin_pct, reasoning, primary_listing_count, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&report.plate)
    .bind(&attrs.brand)
    .bind(&attrs.model)
    .bind(attrs.build_year)
    .bind(attrs.mileage_km as i64)
    .bind(&recommendation)
    .bind(advice.recommended_selling_price)
    .bind(advice.recommended_purchase_price)
    .bind(advice.expected_days_to_sell)
    .bind(advice.target_margin_pct)
    .bind(&advice.reasoning)
    .bind(advice.primary_listing_count as i64)
    .bind(&created_at)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}
