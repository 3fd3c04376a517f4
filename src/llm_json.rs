//! Defensive extraction of JSON from freeform LLM replies.
//!
//! Agents are instructed to answer with a single JSON object, but replies
//! arrive wrapped in code fences, prefixed with prose, or slightly
//! malformed. Nothing past this module ever sees the freeform text.

use std::sync::OnceLock;

use regex::Regex;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("static pattern"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static pattern"))
}

/// Pull the JSON payload out of a freeform reply.
///
/// Order of attack: a fenced ```json block, then the outermost `{...}`
/// span, then the outermost `[...]` span. Returns the trimmed reply itself
/// as a last resort so the caller's parse error names the actual content.
pub fn extract_json(reply: &str) -> String {
    if let Some(caps) = fence_re().captures(reply) {
        if let Some(block) = caps.get(1) {
            return block.as_str().to_string();
        }
    }

    if let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) {
        if start < end {
            return reply[start..=end].to_string();
        }
    }

    if let (Some(start), Some(end)) = (reply.find('['), reply.rfind(']')) {
        if start < end {
            return reply[start..=end].to_string();
        }
    }

    reply.trim().to_string()
}

/// Repair the malformations models actually produce: trailing commas
/// before a closing brace/bracket and raw control characters inside the
/// payload. Anything beyond that is a genuine parse failure.
pub fn repair_json(raw: &str) -> String {
    let without_controls: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    trailing_comma_re()
        .replace_all(&without_controls, "$1")
        .into_owned()
}

/// Extract, repair, and parse in one step. `None` means the reply is
/// unusable; the caller falls back to its degraded result.
pub fn parse_reply(reply: &str) -> Option<serde_json::Value> {
    let extracted = extract_json(reply);
    if let Ok(value) = serde_json::from_str(&extracted) {
        return Some(value);
    }
    let repaired = repair_json(&extracted);
    serde_json::from_str(&repaired).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_block() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\nanything else";
        assert_eq!(extract_json(reply), "{\"a\": 1}");
    }

    #[test]
    fn extracts_unfenced_object_span() {
        let reply = "The listings are {\"a\": {\"b\": 2}} as requested.";
        assert_eq!(extract_json(reply), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn extracts_bare_array() {
        let reply = "results: [1, 2, 3] done";
        assert_eq!(extract_json(reply), "[1, 2, 3]");
    }

    #[test]
    fn repairs_trailing_commas() {
        let raw = "{\"a\": [1, 2,], \"b\": {\"c\": 3,},}";
        let parsed: serde_json::Value = serde_json::from_str(&repair_json(raw)).unwrap();
        assert_eq!(parsed["a"][1], 2);
        assert_eq!(parsed["b"]["c"], 3);
    }

    #[test]
    fn strips_control_characters() {
        let raw = "{\"a\": \"x\u{0001}y\"}";
        let parsed = parse_reply(raw).unwrap();
        assert_eq!(parsed["a"], "xy");
    }

    #[test]
    fn parse_reply_garbage_is_none() {
        assert!(parse_reply("no json here at all").is_none());
        assert!(parse_reply("").is_none());
        assert!(parse_reply("{unclosed").is_none());
    }

    #[test]
    fn parse_reply_combined_fence_and_trailing_comma() {
        let reply = "```json\n{\"listings\": [{\"price\": 100,},],}\n```";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed["listings"][0]["price"], 100);
    }
}
