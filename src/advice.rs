//! Advice synthesis: three source outputs (any subset may be missing) in,
//! one recommendation out.
//!
//! A deterministic baseline is computed first; category thresholds and
//! price derivation live here, not in the model. The LLM reasoning pass
//! adds explanation, risks, and opportunities on top, and may only nudge
//! the outcome: one category level at most, prices within the clamp band.
//! With the LLM unavailable the baseline ships as-is.

use tracing::warn;

use crate::config::{
    verdict_thresholds::{
        BUY_MAX_ETR_DAYS, BUY_MIN_MARGIN_PCT, MIN_SIGNALS_FOR_VERDICT, NO_BUY_MAX_MARGIN_PCT,
        NO_BUY_MIN_ETR_DAYS,
    },
    DEFAULT_MARGIN_PCT, LLM_PRICE_CLAMP_PCT, SALES_PREP_ALLOWANCE_EUR,
};
use crate::llm::LlmClient;
use crate::llm_json::parse_reply;
use crate::types::{
    InternalComparison, PortalAnalysis, PricingIndexResult, Recommendation, ValuationAdvice,
    VehicleAttributes,
};

const SYNTHESIS_SYSTEM: &str = "You advise a used-vehicle trader on acquisitions. Given the \
    data digest, answer with a single JSON object only: {\"recommendation\": \
    \"buy\"|\"no-buy\"|\"uncertain\", \"reasoning\": ..., \"riskFactors\": [...], \
    \"opportunities\": [...], \"indexDeviation\": <explanation or null>, \
    \"recommendedSellingPrice\": <number or null>, \"recommendedPurchasePrice\": \
    <number or null>, \"expectedDaysToSell\": <days>}. Ground every number in the digest; \
    do not invent prices.";

pub async fn synthesize(
    llm: &dyn LlmClient,
    attrs: &VehicleAttributes,
    portal: Option<&PortalAnalysis>,
    index: Option<&PricingIndexResult>,
    internal: &InternalComparison,
) -> ValuationAdvice {
    let baseline = deterministic_baseline(attrs, portal, index, internal);

    let digest = build_digest(attrs, portal, index, internal, &baseline);
    let reply = match llm.generate(SYNTHESIS_SYSTEM, &digest.to_string()).await {
        Ok(text) => text,
        Err(e) => {
            warn!("synthesis reasoning pass unavailable ({e}); using deterministic advice");
            return baseline;
        }
    };
    match parse_reply(&reply) {
        Some(value) => apply_llm_overlay(baseline, &value),
        None => {
            warn!("synthesis reply unusable after repair; using deterministic advice");
            baseline
        }
    }
}

/// How many live price signals feed this run.
fn signal_count(
    portal: Option<&PortalAnalysis>,
    index: Option<&PricingIndexResult>,
    internal: &InternalComparison,
) -> usize {
    let mut n = 0;
    if portal.map(|p| p.has_primaries()).unwrap_or(false) {
        n += 1;
    }
    if index.is_some() {
        n += 1;
    }
    if internal.has_comparables() {
        n += 1;
    }
    n
}

/// Baseline advice from the signals alone. The recommended purchase price
/// derives from the index total value, the portal median, or the internal
/// margin applied to one of those estimates; never from nothing.
pub fn deterministic_baseline(
    attrs: &VehicleAttributes,
    portal: Option<&PortalAnalysis>,
    index: Option<&PricingIndexResult>,
    internal: &InternalComparison,
) -> ValuationAdvice {
    let portal_median = portal.and_then(|p| p.median_price);
    let index_total = index.map(|i| i.total_value);
    let estimate = index_total.or(portal_median);

    let margin = if internal.has_comparables() {
        internal.avg_margin_pct
    } else {
        DEFAULT_MARGIN_PCT
    };

    let expected_days = index
        .and_then(|i| i.etr_days)
        .or(internal.avg_days_to_sell_b2c)
        .unwrap_or(internal.avg_days_to_sell);

    let recommended_selling_price = estimate;
    let recommended_purchase_price = estimate
        .map(|e| (e * (1.0 - margin / 100.0) - SALES_PREP_ALLOWANCE_EUR).max(0.0));

    let signals = signal_count(portal, index, internal);
    let recommendation = if signals < MIN_SIGNALS_FOR_VERDICT || estimate.is_none() {
        Recommendation::Uncertain
    } else if margin < NO_BUY_MAX_MARGIN_PCT || expected_days > NO_BUY_MIN_ETR_DAYS {
        Recommendation::NoBuy
    } else if margin >= BUY_MIN_MARGIN_PCT && expected_days <= BUY_MAX_ETR_DAYS {
        Recommendation::Buy
    } else {
        Recommendation::Uncertain
    };

    let index_deviation = match (index_total, portal_median) {
        (Some(idx), Some(med)) if idx > 0.0 && ((med - idx) / idx).abs() > 0.10 => Some(format!(
            "Pricing index ({idx:.0}) and marketplace median ({med:.0}) differ by more \
             than 10%; the marketplace side reflects current asking prices."
        )),
        _ => None,
    };

    let primary_listing_count = portal.map(|p| p.primary_count).unwrap_or(0);

    ValuationAdvice {
        recommended_selling_price,
        recommended_purchase_price,
        expected_days_to_sell: expected_days,
        target_margin_pct: margin,
        recommendation,
        reasoning: deterministic_reasoning(attrs, signals, estimate, margin, recommendation),
        index_deviation,
        risk_factors: Vec::new(),
        opportunities: Vec::new(),
        primary_listing_count,
    }
}

fn deterministic_reasoning(
    attrs: &VehicleAttributes,
    signals: usize,
    estimate: Option<f64>,
    margin: f64,
    recommendation: Recommendation,
) -> String {
    match (recommendation, estimate) {
        (Recommendation::Uncertain, None) => format!(
            "No price signal is available for the {}; neither the pricing index, the \
             marketplace search, nor internal sales produced a usable figure. No purchase \
             price can be recommended.",
            attrs.label()
        ),
        (Recommendation::Uncertain, Some(e)) if signals < MIN_SIGNALS_FOR_VERDICT => format!(
            "Only {signals} of 3 price sources produced data for the {} (estimate {e:.0}). \
             Too thin for a buy/no-buy verdict.",
            attrs.label()
        ),
        (rec, Some(e)) => format!(
            "Market estimate {e:.0} for the {} with a {margin:.1}% target margin across \
             {signals} sources leads to {rec}.",
            attrs.label()
        ),
        (rec, None) => format!("{rec} for the {} based on margin signals only.", attrs.label()),
    }
}

fn build_digest(
    attrs: &VehicleAttributes,
    portal: Option<&PortalAnalysis>,
    index: Option<&PricingIndexResult>,
    internal: &InternalComparison,
    baseline: &ValuationAdvice,
) -> serde_json::Value {
    serde_json::json!({
        "vehicle": {
            "label": attrs.label(),
            "mileageKm": attrs.mileage_km,
            "fuelType": attrs.fuel_type,
            "transmission": attrs.transmission,
        },
        "portal": portal.map(|p| serde_json::json!({
            "primaryCount": p.primary_count,
            "lowest": p.lowest_price,
            "median": p.median_price,
            "highest": p.highest_price,
            "deviations": p.deviations.len(),
        })),
        "pricingIndex": index.map(|i| serde_json::json!({
            "totalValue": i.total_value,
            "range": [i.min_value, i.max_value],
            "apr": i.apr,
            "etrDays": i.etr_days,
            "liquidity": i.liquidity.to_string(),
        })),
        "internalSales": {
            "matchTier": internal.match_tier.to_string(),
            "avgMarginPct": internal.avg_margin_pct,
            "avgDaysToSell": internal.avg_days_to_sell,
            "avgDaysToSellB2c": internal.avg_days_to_sell_b2c,
            "counts": { "b2b": internal.b2b_count, "b2c": internal.b2c_count },
            "widenedNote": internal.widened_note,
        },
        "baseline": {
            "recommendation": baseline.recommendation.to_string(),
            "recommendedSellingPrice": baseline.recommended_selling_price,
            "recommendedPurchasePrice": baseline.recommended_purchase_price,
            "expectedDaysToSell": baseline.expected_days_to_sell,
        },
    })
}

fn level(rec: Recommendation) -> i8 {
    match rec {
        Recommendation::Buy => 0,
        Recommendation::Uncertain => 1,
        Recommendation::NoBuy => 2,
    }
}

/// Merge the reasoning pass into the baseline under the guardrails: the
/// category may move one level, prices stay inside the clamp band around
/// the baseline, and no price appears where the baseline had none.
fn apply_llm_overlay(mut advice: ValuationAdvice, value: &serde_json::Value) -> ValuationAdvice {
    // Without a derived price there is nothing to verdict on; the
    // category stays uncertain no matter what the model says.
    if advice.recommended_purchase_price.is_some() {
        if let Some(rec) = value
            .get("recommendation")
            .and_then(|v| v.as_str())
            .and_then(Recommendation::parse)
        {
            if (level(rec) - level(advice.recommendation)).abs() <= 1 {
                advice.recommendation = rec;
            }
        }
    }

    if let Some(text) = value.get("reasoning").and_then(|v| v.as_str()) {
        if !text.trim().is_empty() {
            advice.reasoning = text.trim().to_string();
        }
    }

    advice.risk_factors = string_list(value, "riskFactors");
    advice.opportunities = string_list(value, "opportunities");

    if let Some(text) = value.get("indexDeviation").and_then(|v| v.as_str()) {
        if !text.trim().is_empty() {
            advice.index_deviation = Some(text.trim().to_string());
        }
    }

    advice.recommended_selling_price = clamp_price(
        advice.recommended_selling_price,
        value.get("recommendedSellingPrice").and_then(|v| v.as_f64()),
    );
    advice.recommended_purchase_price = clamp_price(
        advice.recommended_purchase_price,
        value.get("recommendedPurchasePrice").and_then(|v| v.as_f64()),
    );

    if let Some(days) = value.get("expectedDaysToSell").and_then(|v| v.as_i64()) {
        if (1..=365).contains(&days) {
            advice.expected_days_to_sell = days;
        }
    }

    advice
}

fn clamp_price(baseline: Option<f64>, suggested: Option<f64>) -> Option<f64> {
    let base = baseline?;
    match suggested {
        Some(s) if s > 0.0 => {
            let lo = base * (1.0 - LLM_PRICE_CLAMP_PCT);
            let hi = base * (1.0 + LLM_PRICE_CLAMP_PCT);
            Some(s.clamp(lo, hi))
        }
        _ => Some(base),
    }
}

fn string_list(value: &serde_json::Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
