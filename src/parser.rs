//! Free-text vehicle parser for bulk mode: supplier descriptions →
//! canonical attributes plus a confidence score.
//!
//! Primary path is one LLM extraction call per chunk of descriptions;
//! the deterministic pattern fallback covers an unavailable or
//! misconfigured extraction service and individually malformed reply
//! items. One bad description never fails a chunk.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{
    FALLBACK_CONFIDENCE_BASE, FALLBACK_CONFIDENCE_CAP, FALLBACK_CONFIDENCE_STEP,
    PARSER_CHUNK_SIZE,
};
use crate::llm::LlmClient;
use crate::llm_json::parse_reply;
use crate::types::{ParseSource, ParsedVehicle, VehicleAttributes};

/// Closed brand catalogue given to the LLM and scanned by the fallback.
pub const BRAND_CATALOGUE: &[&str] = &[
    "Alfa Romeo", "Audi", "BMW", "BYD", "Citroen", "Cupra", "Dacia", "DS",
    "Fiat", "Ford", "Honda", "Hyundai", "Jaguar", "Jeep", "Kia", "Land Rover",
    "Lexus", "Lynk & Co", "Mazda", "Mercedes-Benz", "MG", "Mini", "Mitsubishi",
    "Nissan", "Opel", "Peugeot", "Polestar", "Porsche", "Renault", "Seat",
    "Skoda", "Smart", "Subaru", "Suzuki", "Tesla", "Toyota", "Volkswagen",
    "Volvo",
];

const FUEL_KEYWORDS: &[&str] = &[
    "benzine", "petrol", "diesel", "hybride", "hybrid", "elektrisch",
    "electric", "lpg", "cng", "waterstof",
];

const TRANSMISSION_KEYWORDS: &[&str] = &[
    "automaat", "automatic", "handgeschakeld", "handmatig", "manual",
];

const BODY_KEYWORDS: &[&str] = &[
    "hatchback", "sedan", "suv", "stationwagon", "station", "coupe",
    "cabrio", "cabriolet", "mpv", "bestelwagen", "pickup",
];

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").expect("static pattern"))
}

fn power_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d{2,4})\s?(?:pk|hp)\b").expect("static pattern"))
}

fn mileage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{1,3}(?:[.,]\d{3})+|\d{4,7})\s?km\b").expect("static pattern")
    })
}

const EXTRACTION_SYSTEM: &str = "You extract vehicle attributes from used-car trade \
    descriptions. Answer with a single JSON object only, no prose: \
    {\"vehicles\": [{\"index\": <input index>, \"brand\": ..., \"model\": ..., \
    \"trim\": ..., \"buildYear\": ..., \"mileageKm\": ..., \"fuelType\": ..., \
    \"transmission\": ..., \"bodyType\": ..., \"powerHp\": ..., \"color\": ..., \
    \"confidence\": 0.0-1.0}]}. Use null for anything the text does not state. \
    The brand must be one of the given catalogue entries.";

/// Parse a batch of descriptions. The LLM handles up to
/// `PARSER_CHUNK_SIZE` items per call; every item the LLM path cannot
/// cover falls back to the pattern parse. Output order mirrors the input.
pub async fn parse_descriptions(
    llm: &dyn LlmClient,
    descriptions: &[String],
) -> Vec<ParsedVehicle> {
    let mut out = Vec::with_capacity(descriptions.len());
    for chunk in descriptions.chunks(PARSER_CHUNK_SIZE) {
        out.extend(parse_chunk(llm, chunk).await);
    }
    out
}

async fn parse_chunk(llm: &dyn LlmClient, chunk: &[String]) -> Vec<ParsedVehicle> {
    let extracted = match extract_via_llm(llm, chunk).await {
        Ok(items) => items,
        Err(reason) => {
            warn!("LLM extraction unavailable ({reason}); using pattern fallback for {} rows", chunk.len());
            vec![None; chunk.len()]
        }
    };

    chunk
        .iter()
        .zip(extracted)
        .map(|(description, parsed)| match parsed {
            Some(vehicle) => vehicle,
            None => parse_fallback(description),
        })
        .collect()
}

/// One extraction call for a chunk. `Ok` holds a per-input slot; a slot is
/// `None` when the reply item for that index was missing or malformed.
async fn extract_via_llm(
    llm: &dyn LlmClient,
    chunk: &[String],
) -> std::result::Result<Vec<Option<ParsedVehicle>>, String> {
    let numbered: Vec<String> = chunk
        .iter()
        .enumerate()
        .map(|(i, d)| format!("{i}: {d}"))
        .collect();
    let prompt = format!(
        "Brand catalogue: {}.\n\nDescriptions:\n{}",
        BRAND_CATALOGUE.join(", "),
        numbered.join("\n")
    );

    let reply = llm
        .generate(EXTRACTION_SYSTEM, &prompt)
        .await
        .map_err(|e| e.to_string())?;
    let value = parse_reply(&reply).ok_or_else(|| "unparseable reply".to_string())?;

    let items = value
        .get("vehicles")
        .and_then(|v| v.as_array())
        .cloned()
        .or_else(|| value.as_array().cloned())
        .ok_or_else(|| "reply has no vehicle array".to_string())?;

    let mut slots: Vec<Option<ParsedVehicle>> = vec![None; chunk.len()];
    for item in &items {
        let Some(idx) = item.get("index").and_then(|v| v.as_u64()).map(|i| i as usize)
        else {
            continue;
        };
        if idx >= slots.len() {
            continue;
        }
        slots[idx] = parse_llm_item(item);
    }
    debug!(
        parsed = slots.iter().filter(|s| s.is_some()).count(),
        total = chunk.len(),
        "LLM extraction pass"
    );
    Ok(slots)
}

/// A usable LLM item needs at least a catalogued brand; anything else is
/// left for the fallback.
fn parse_llm_item(item: &serde_json::Value) -> Option<ParsedVehicle> {
    let brand_raw = item.get("brand").and_then(|v| v.as_str())?;
    let brand = BRAND_CATALOGUE
        .iter()
        .find(|b| b.eq_ignore_ascii_case(brand_raw.trim()))?
        .to_string();

    let text = |key: &str| {
        item.get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Some(ParsedVehicle {
        attributes: VehicleAttributes {
            brand,
            model: text("model").unwrap_or_default(),
            trim: text("trim"),
            build_year: item.get("buildYear").and_then(|v| v.as_i64()).map(|y| y as i32),
            mileage_km: item
                .get("mileageKm")
                .and_then(|v| v.as_u64())
                .map(|m| m as u32)
                .unwrap_or(0),
            fuel_type: text("fuelType"),
            transmission: text("transmission"),
            body_type: text("bodyType"),
            power_hp: item.get("powerHp").and_then(|v| v.as_u64()).map(|p| p as u32),
            color: text("color"),
            options: Vec::new(),
        },
        confidence: item
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        source: ParseSource::Llm,
    })
}

/// Deterministic pattern parse. Never fails; unmatched fields stay None
/// and confidence accumulates from the 0.3 base per matched field family.
pub fn parse_fallback(description: &str) -> ParsedVehicle {
    let tokens: Vec<&str> = description.split_whitespace().collect();
    let lower = description.to_lowercase();

    let mut confidence = FALLBACK_CONFIDENCE_BASE;
    let mut bump = |matched: bool| {
        if matched {
            confidence = (confidence + FALLBACK_CONFIDENCE_STEP).min(FALLBACK_CONFIDENCE_CAP);
        }
        matched
    };

    let brand_hit = find_brand(&tokens);
    bump(brand_hit.is_some());
    let (brand, brand_end) = brand_hit.unwrap_or((String::new(), 0));

    let build_year = year_re()
        .find(&lower)
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .filter(|y| (1980..=2030).contains(y));
    bump(build_year.is_some());

    let fuel_type = match_keyword(&tokens, FUEL_KEYWORDS);
    bump(fuel_type.is_some());

    let transmission = match_keyword(&tokens, TRANSMISSION_KEYWORDS);
    bump(transmission.is_some());

    let body_type = match_keyword(&tokens, BODY_KEYWORDS);
    bump(body_type.is_some());

    let power_hp = power_re()
        .captures(description)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());
    bump(power_hp.is_some());

    let mileage_km = mileage_re()
        .captures(description)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(['.', ','], "").parse::<u32>().ok())
        .unwrap_or(0);

    let model = if brand.is_empty() {
        String::new()
    } else {
        guess_model(&tokens, brand_end, build_year)
    };

    ParsedVehicle {
        attributes: VehicleAttributes {
            brand,
            model,
            trim: None,
            build_year,
            mileage_km,
            fuel_type,
            transmission,
            body_type,
            power_hp,
            color: None,
            options: Vec::new(),
        },
        confidence,
        source: ParseSource::Pattern,
    }
}

/// Scan tokens for a catalogued brand. Multi-word brands must match all
/// their words consecutively; longer first words (Mercedes, Polestar) also
/// match alone so "Mercedes C200" resolves without the "-Benz" suffix.
/// Returns the canonical brand and the token index just past the match.
fn find_brand(tokens: &[&str]) -> Option<(String, usize)> {
    let norm: Vec<String> = tokens
        .iter()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .collect();

    for brand in BRAND_CATALOGUE {
        let words: Vec<String> = brand
            .split(|c: char| c == ' ' || c == '-' || c == '&')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for (i, token) in norm.iter().enumerate() {
            // whole brand as one token ("mercedes-benz")
            let joined = brand.to_lowercase();
            if *token == joined || token.replace('-', "") == joined.replace(['-', ' ', '&'], "") {
                return Some((brand.to_string(), i + 1));
            }
            if *token != words[0] {
                continue;
            }
            if words.len() == 1 {
                return Some((brand.to_string(), i + 1));
            }
            let tail_matches = words[1..]
                .iter()
                .enumerate()
                .all(|(j, w)| norm.get(i + 1 + j).map(|t| t == w).unwrap_or(false));
            if tail_matches {
                return Some((brand.to_string(), i + words.len()));
            }
            if words[0].len() >= 6 {
                return Some((brand.to_string(), i + 1));
            }
        }
    }
    None
}

/// Up to two tokens after the brand, skipping anything that reads as a
/// year, mileage, power figure, or known keyword.
fn guess_model(tokens: &[&str], brand_end: usize, build_year: Option<i32>) -> String {
    let year_str = build_year.map(|y| y.to_string());
    tokens
        .iter()
        .skip(brand_end)
        .filter(|t| {
            let lower = t.to_lowercase();
            if let Some(y) = &year_str {
                if t.contains(y.as_str()) {
                    return false;
                }
            }
            if lower == "km" || t.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
                return false;
            }
            !FUEL_KEYWORDS.contains(&lower.as_str())
                && !TRANSMISSION_KEYWORDS.contains(&lower.as_str())
                && !BODY_KEYWORDS.contains(&lower.as_str())
                && !power_re().is_match(t)
                && !mileage_re().is_match(t)
        })
        .take(2)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First token matching the dictionary, returned with its original casing.
fn match_keyword(tokens: &[&str], dictionary: &[&str]) -> Option<String> {
    tokens
        .iter()
        .find(|t| {
            let lower = t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            dictionary.contains(&lower.as_str())
        })
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    #[tokio::test]
    async fn fallback_parses_the_bmw_scenario() {
        let llm = MockLlm::unavailable();
        let rows = vec!["BMW 320i 2019 Automaat Benzine 150pk".to_string()];
        let parsed = parse_descriptions(&llm, &rows).await;

        assert_eq!(parsed.len(), 1);
        let v = &parsed[0];
        assert_eq!(v.source, ParseSource::Pattern);
        assert_eq!(v.attributes.brand, "BMW");
        assert_eq!(v.attributes.model, "320i");
        assert_eq!(v.attributes.build_year, Some(2019));
        assert_eq!(v.attributes.transmission.as_deref(), Some("Automaat"));
        assert_eq!(v.attributes.fuel_type.as_deref(), Some("Benzine"));
        assert_eq!(v.attributes.power_hp, Some(150));
        assert!(v.confidence > 0.3);
    }

    #[test]
    fn fallback_never_panics_on_noise() {
        for junk in ["", "???", "12345", "geen auto maar een fiets"] {
            let v = parse_fallback(junk);
            assert_eq!(v.source, ParseSource::Pattern);
            assert!(v.confidence >= FALLBACK_CONFIDENCE_BASE);
            assert!(v.attributes.brand.is_empty());
        }
    }

    #[test]
    fn fallback_matches_multiword_and_partial_brands() {
        let v = parse_fallback("Land Rover Discovery 2018 Diesel");
        assert_eq!(v.attributes.brand, "Land Rover");
        assert_eq!(v.attributes.model, "Discovery");

        let v = parse_fallback("Mercedes C200 2021 Automaat");
        assert_eq!(v.attributes.brand, "Mercedes-Benz");
        assert_eq!(v.attributes.model, "C200");
    }

    #[test]
    fn fallback_reads_mileage_with_separators() {
        let v = parse_fallback("Volkswagen Golf 2020 60.000 km Benzine");
        assert_eq!(v.attributes.mileage_km, 60_000);
        assert_eq!(v.attributes.model, "Golf");
    }

    #[test]
    fn confidence_accumulates_per_family() {
        let sparse = parse_fallback("Opel 2015");
        let rich = parse_fallback("Opel Astra 2015 Diesel Handgeschakeld 110pk hatchback");
        assert!(rich.confidence > sparse.confidence);
        assert!(rich.confidence <= FALLBACK_CONFIDENCE_CAP);
    }

    #[tokio::test]
    async fn llm_path_parses_well_formed_reply() {
        let reply = r#"```json
        {"vehicles": [
          {"index": 0, "brand": "Volkswagen", "model": "Golf", "buildYear": 2020,
           "mileageKm": 60000, "fuelType": "Benzine", "transmission": "Automaat",
           "confidence": 0.9}
        ]}
        ```"#;
        let llm = MockLlm::new(reply);
        let rows = vec!["VW Golf 2020 60.000 km benzine automaat".to_string()];
        let parsed = parse_descriptions(&llm, &rows).await;

        assert_eq!(parsed[0].source, ParseSource::Llm);
        assert_eq!(parsed[0].attributes.brand, "Volkswagen");
        assert_eq!(parsed[0].attributes.mileage_km, 60_000);
        assert_eq!(parsed[0].confidence, 0.9);
    }

    #[tokio::test]
    async fn malformed_llm_item_falls_back_per_row() {
        // Item 0 has an uncatalogued brand, item 1 is fine.
        let reply = r#"{"vehicles": [
          {"index": 0, "brand": "Yugo", "model": "45"},
          {"index": 1, "brand": "BMW", "model": "118i", "confidence": 0.8}
        ]}"#;
        let llm = MockLlm::new(reply);
        let rows = vec![
            "Skoda Octavia 2017 Diesel".to_string(),
            "BMW 118i 2020".to_string(),
        ];
        let parsed = parse_descriptions(&llm, &rows).await;

        assert_eq!(parsed[0].source, ParseSource::Pattern);
        assert_eq!(parsed[0].attributes.brand, "Skoda");
        assert_eq!(parsed[1].source, ParseSource::Llm);
        assert_eq!(parsed[1].attributes.brand, "BMW");
    }

    #[tokio::test]
    async fn garbage_reply_falls_back_for_all_rows() {
        let llm = MockLlm::new("sorry, I cannot help with that");
        let rows = vec![
            "Toyota Yaris 2018 Hybride".to_string(),
            "Ford Focus 2016".to_string(),
        ];
        let parsed = parse_descriptions(&llm, &rows).await;
        assert!(parsed.iter().all(|p| p.source == ParseSource::Pattern));
        assert_eq!(parsed[0].attributes.brand, "Toyota");
        assert_eq!(parsed[1].attributes.brand, "Ford");
    }
}
