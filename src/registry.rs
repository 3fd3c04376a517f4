//! Plate → canonical vehicle attributes via the external registry.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::VehicleAttributes;

/// Strip separators and uppercase. "ab-123-c" → "AB123C".
pub fn normalize_plate(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

#[async_trait]
pub trait VehicleRegistry: Send + Sync {
    /// Resolve a plate to registry attributes. `NotFound` when the registry
    /// has no record, `Upstream` on call failure; neither is retried.
    async fn resolve(&self, plate: &str) -> Result<VehicleAttributes>;
}

pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
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
impl VehicleRegistry for HttpRegistry {
    async fn resolve(&self, plate: &str) -> Result<VehicleAttributes> {
        let normalized = normalize_plate(plate);
        if normalized.is_empty() {
            return Err(AppError::NotFound(format!("unusable plate {plate:?}")));
        }

        let url = format!("{}/vehicles?plate={}", self.base_url, normalized);
        debug!(plate = %normalized, "registry lookup");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("registry: {e}")))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(AppError::NotFound(format!("plate {normalized} not registered")));
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!("registry returned {status}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("registry body: {e}")))?;

        // The registry answers with an array of records for the plate;
        // an empty array means no record exists.
        let record = if payload.is_array() {
            payload.as_array().and_then(|items| items.first().cloned())
        } else {
            Some(payload)
        };
        let record = record
            .filter(|r| r.is_object())
            .ok_or_else(|| AppError::NotFound(format!("plate {normalized} not registered")))?;

        parse_registry_record(&record, &normalized)
    }
}

/// Map one registry record to attributes. Registries carry no mileage,
/// trim, or options; those stay empty for the caller to fill in.
fn parse_registry_record(record: &serde_json::Value, plate: &str) -> Result<VehicleAttributes> {
    let brand = string_field(record, &["brand", "make", "merk"]);
    let model = string_field(record, &["model", "tradeName", "handelsbenaming"]);

    let (brand, model) = match (brand, model) {
        (Some(b), Some(m)) => (b, m),
        _ => {
            return Err(AppError::NotFound(format!(
                "registry record for {plate} is missing brand/model"
            )))
        }
    };

    let build_year = record
        .get("buildYear")
        .or_else(|| record.get("firstRegistrationYear"))
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s[..4.min(s.len())].parse().ok()))
        })
        .map(|y| y as i32);

    Ok(VehicleAttributes {
        brand,
        model,
        trim: None,
        build_year,
        mileage_km: 0,
        fuel_type: string_field(record, &["fuelType", "brandstof"]),
        transmission: string_field(record, &["transmission", "transmissie"]),
        body_type: string_field(record, &["bodyType", "carrosserie"]),
        power_hp: record
            .get("powerHp")
            .and_then(|v| v.as_u64())
            .map(|p| p as u32),
        color: string_field(record, &["color", "eerste_kleur"]),
        options: Vec::new(),
    })
}

fn string_field(record: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        record
            .get(*k)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
