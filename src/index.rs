//! Passthrough adapter for the third-party pricing index.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::registry::normalize_plate;
use crate::types::{LiquidityClass, PricingIndexResult};

#[async_trait]
pub trait PricingIndex: Send + Sync {
    /// `Ok(None)` when the plate is unknown to the index; a normal
    /// outcome, not an error.
    async fn lookup(&self, plate: &str) -> Result<Option<PricingIndexResult>>;
}

pub struct HttpPricingIndex {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPricingIndex {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PricingIndex for HttpPricingIndex {
    async fn lookup(&self, plate: &str) -> Result<Option<PricingIndexResult>> {
        let normalized = normalize_plate(plate);
        let url = format!("{}/valuations/{}", self.base_url, normalized);
        debug!(plate = %normalized, "pricing index lookup");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("pricing index: {e}")))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!("pricing index returned {status}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("pricing index body: {e}")))?;

        Ok(parse_index_record(&payload))
    }
}

/// Forward the index fields unchanged. A record without a total value is
/// treated as absent.
pub fn parse_index_record(payload: &serde_json::Value) -> Option<PricingIndexResult> {
    let total_value = num_field(payload, &["totalValue", "total_value"])?;

    Some(PricingIndexResult {
        base_value: num_field(payload, &["baseValue", "base_value"]).unwrap_or(total_value),
        option_value: num_field(payload, &["optionValue", "option_value"]).unwrap_or(0.0),
        total_value,
        min_value: num_field(payload, &["minValue", "min_value"]),
        max_value: num_field(payload, &["maxValue", "max_value"]),
        confidence: num_field(payload, &["confidence"]),
        apr: num_field(payload, &["apr", "averagePriceRatio"]),
        etr_days: num_field(payload, &["etrDays", "etr", "expectedTimeToRetail"])
            .map(|d| d.round() as i64),
        liquidity: payload
            .get("liquidity")
            .and_then(|v| v.as_str())
            .map(LiquidityClass::parse)
            .unwrap_or(LiquidityClass::Unknown),
    })
}

fn num_field(payload: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        payload.get(*k).and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    })
}
