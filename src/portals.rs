//! Comparable listings aggregator.
//!
//! Listing discovery is delegated to a web-search-capable LLM agent that
//! opens the marketplace search URL and reads the first page ordered by
//! ascending price. The agent's freeform reply never leaves this module:
//! it is extracted, repaired, and validated here, and every failure mode
//! degrades to `PortalAnalysis::empty()` so the rest of the pipeline can
//! proceed.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::SearchCache;
use crate::config::MAX_LISTINGS_PER_SEARCH;
use crate::llm::LlmClient;
use crate::llm_json::parse_reply;
use crate::types::{ComparableListing, PortalAnalysis, VehicleAttributes};

const SEARCH_SYSTEM: &str = "You are a used-car market analyst with web access. Open the \
    given marketplace search URL, read the first result page (sorted by price, ascending) \
    and return the listings as a single JSON object, no prose: \
    {\"listings\": [{\"source\": ..., \"url\": ..., \"title\": ..., \"price\": <number>, \
    \"mileageKm\": ..., \"buildYear\": ..., \"color\": ..., \"options\": [...], \
    \"matchScore\": 0.0-1.0, \"isPrimary\": <bool>, \"isDeviation\": <bool>, \
    \"deviationReason\": ...}], \"appliedFilters\": [...]}. Mark a listing as a deviation \
    when its price/mileage/year combination is inconsistent with its peers, and explain why.";

pub struct PortalAggregator {
    llm: Arc<dyn LlmClient>,
    cache: Arc<SearchCache>,
    marketplace_url: String,
}

impl PortalAggregator {
    pub fn new(llm: Arc<dyn LlmClient>, cache: Arc<SearchCache>, marketplace_url: &str) -> Self {
        Self {
            llm,
            cache,
            marketplace_url: marketplace_url.trim_end_matches('/').to_string(),
        }
    }

    /// Search the marketplace for comparables. Never errors: no search
    /// URL, an agent failure, or an unusable reply all yield the empty
    /// analysis.
    pub async fn search(&self, attrs: &VehicleAttributes) -> PortalAnalysis {
        let Some(search_url) = build_search_url(&self.marketplace_url, attrs) else {
            debug!("no search URL possible (brand/model missing)");
            return PortalAnalysis::empty();
        };

        let key = cache_key(attrs);
        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "portal search cache hit");
            return hit;
        }

        let prompt = format!(
            "Target vehicle: {}.\nSearch URL: {}\nReturn at most {} listings.",
            attrs.label(),
            search_url,
            MAX_LISTINGS_PER_SEARCH,
        );

        let reply = match self.llm.generate(SEARCH_SYSTEM, &prompt).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("search agent returned no text; continuing without portal data");
                return PortalAnalysis::empty();
            }
            Err(e) => {
                warn!("search agent failed: {e}; continuing without portal data");
                return PortalAnalysis::empty();
            }
        };

        let analysis = match parse_agent_reply(&reply, &search_url) {
            Some(analysis) => analysis,
            None => {
                warn!("search agent reply unusable after repair; continuing without portal data");
                let mut empty = PortalAnalysis::empty();
                empty.search_url = Some(search_url);
                return empty;
            }
        };

        if analysis.has_primaries() {
            self.cache.insert(&key, analysis.clone());
        }
        analysis
    }
}

/// Marketplace search URL, ordered by ascending price. Brand and model are
/// required; year and fuel refine the query when known.
pub fn build_search_url(marketplace_url: &str, attrs: &VehicleAttributes) -> Option<String> {
    if attrs.brand.trim().is_empty() || attrs.model.trim().is_empty() {
        return None;
    }
    let mut url = format!(
        "{}/zoeken?brand={}&model={}&sort=price-asc",
        marketplace_url,
        url_segment(&attrs.brand),
        url_segment(&attrs.model),
    );
    if let Some(year) = attrs.build_year {
        url.push_str(&format!("&yearFrom={}&yearTo={}", year - 1, year + 1));
    }
    if let Some(fuel) = &attrs.fuel_type {
        url.push_str(&format!("&fuel={}", url_segment(fuel)));
    }
    Some(url)
}

fn url_segment(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn cache_key(attrs: &VehicleAttributes) -> String {
    format!(
        "{}|{}|{}|{}",
        attrs.brand.to_lowercase(),
        attrs.model.to_lowercase(),
        attrs.build_year.map(|y| y.to_string()).unwrap_or_default(),
        attrs
            .fuel_type
            .as_deref()
            .unwrap_or_default()
            .to_lowercase(),
    )
}

/// Turn the agent's reply into an analysis. `None` only when the reply
/// cannot be interpreted at all; the caller maps that to empty.
fn parse_agent_reply(reply: &str, search_url: &str) -> Option<PortalAnalysis> {
    let value = parse_reply(reply)?;
    let items = value.get("listings").and_then(|v| v.as_array())?;

    let mut listings: Vec<ComparableListing> = Vec::new();
    for item in items.iter().take(MAX_LISTINGS_PER_SEARCH) {
        if let Some(listing) = parse_listing(item) {
            listings.push(listing);
        }
    }

    let applied_filters = value
        .get("appliedFilters")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let (primaries, deviations): (Vec<_>, Vec<_>) =
        listings.into_iter().partition(|l| l.is_primary);

    let mut prices: Vec<f64> = primaries.iter().map(|l| l.price).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    Some(PortalAnalysis {
        lowest_price: prices.first().copied(),
        median_price: median(&prices),
        highest_price: prices.last().copied(),
        listing_count: primaries.len() + deviations.len(),
        primary_count: primaries.len(),
        applied_filters,
        listings: primaries,
        deviations,
        search_url: Some(search_url.to_string()),
    })
}

/// A usable listing needs a URL and a numeric price. Deviation-flagged
/// listings are never primary; the two sets stay disjoint.
fn parse_listing(item: &serde_json::Value) -> Option<ComparableListing> {
    let url = item
        .get("url")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let price = item.get("price").and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.replace(['.', ','], "").parse().ok()))
    })?;
    if price <= 0.0 {
        return None;
    }

    let is_deviation = item
        .get("isDeviation")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let is_primary = !is_deviation
        && item
            .get("isPrimary")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

    Some(ComparableListing {
        source: item
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("marketplace")
            .to_string(),
        url,
        title: item
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        price,
        mileage_km: item
            .get("mileageKm")
            .and_then(|v| v.as_u64())
            .map(|m| m as u32),
        build_year: item
            .get("buildYear")
            .and_then(|v| v.as_i64())
            .map(|y| y as i32),
        color: item
            .get("color")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        options: item
            .get("options")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|o| o.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        match_score: item
            .get("matchScore")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        is_primary,
        is_deviation,
        deviation_reason: item
            .get("deviationReason")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn median(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}
