//! JSON repair state machine for LLM responses (§4.4, §9 REDESIGN FLAGS).
//!
//! Both `summarize` and `decide` responses go through the same four-step
//! recovery ladder: strip code fences, strict parse, balanced-brace extract,
//! regex rescue. Each step is logged so the caller can tell which one fired.

use serde::Deserialize;
use tracing::debug;

/// Strips a leading/trailing ``` or ```json fence, if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Scans from the first `{` and returns the first balanced-brace substring,
/// tolerating leading prose before it and trailing prose after it.
pub fn extract_balanced_braces(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        let ch = byte as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionRaw {
    pub decision: Option<String>,
    pub target_run_id: Option<String>,
    pub reason: Option<String>,
}

/// Runs the full repair ladder against a `decide()` response, returning
/// `None` only if every recovery step fails (caller then fails open to ADD).
pub fn repair_decision_json(raw: &str) -> Option<DecisionRaw> {
    let stripped = strip_code_fences(raw);

    if let Ok(parsed) = serde_json::from_str::<DecisionRaw>(stripped) {
        debug!(path = "strict-parse", "decision JSON repaired");
        return Some(parsed);
    }

    if let Some(braced) = extract_balanced_braces(stripped) {
        if let Ok(parsed) = serde_json::from_str::<DecisionRaw>(braced) {
            debug!(path = "balanced-brace-extract", "decision JSON repaired");
            return Some(parsed);
        }
    }

    if let Some(decision) = regex_rescue_decision(stripped) {
        debug!(path = "regex-rescue", "decision JSON repaired");
        return Some(DecisionRaw {
            decision: Some(decision),
            target_run_id: None,
            reason: None,
        });
    }

    debug!(path = "default", "decision JSON repair exhausted, failing open");
    None
}

fn regex_rescue_decision(raw: &str) -> Option<String> {
    let re = regex::Regex::new(r#""decision"\s*:\s*"([^"]+)""#).ok()?;
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parsed `summarize()` response (§4.2): prose summary plus 2-4 short
/// justification bullets, tolerating the same fence/prose noise.
#[derive(Debug, Clone, Deserialize)]
struct SummaryRaw {
    summary: String,
    #[serde(default)]
    why_added: Vec<String>,
}

pub struct ParsedSummary {
    pub summary: String,
    pub why_added: Vec<String>,
}

/// Parses a `summarize()` response, applying the same fence-strip and
/// balanced-brace recovery as `repair_decision_json`.
pub fn parse_summary_response(raw: &str) -> Option<ParsedSummary> {
    let stripped = strip_code_fences(raw);

    let parsed: SummaryRaw = serde_json::from_str(stripped)
        .ok()
        .or_else(|| extract_balanced_braces(stripped).and_then(|b| serde_json::from_str(b).ok()))?;

    Some(ParsedSummary {
        summary: parsed.summary,
        why_added: parsed.why_added,
    })
}

/// Renders bullets the way the LLM-authored `reason_added` is shown to users:
/// one `•`-prefixed line per bullet, any pre-existing bullet marker stripped.
pub fn render_bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|item| {
            let cleaned = item.trim().trim_start_matches(['•', '-', '*']).trim();
            format!("• {cleaned}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Synthesizes the §4.2 fallback: two bullets built from the summary's first
/// sentence and the run's outcome, used when `why_added` is absent or empty.
pub fn fallback_bullets(summary: &str, outcome_label: &str) -> Vec<String> {
    let first_sentence = summary
        .split(['.', '!', '?'])
        .next()
        .unwrap_or(summary)
        .trim()
        .to_string();
    vec![first_sentence, format!("Outcome: {outcome_label}")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn strips_bare_fence() {
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn extracts_balanced_braces_with_leading_prose() {
        let raw = "Sure, here you go: {\"decision\": \"ADD\", \"nested\": {\"x\": 1}} trailing junk";
        let extracted = extract_balanced_braces(raw).unwrap();
        assert!(extracted.starts_with('{'));
        assert!(extracted.ends_with('}'));
        assert!(serde_json::from_str::<serde_json::Value>(extracted).is_ok());
    }

    #[test]
    fn repairs_strict_json() {
        let parsed = repair_decision_json(r#"{"decision":"ADD","reason":"novel"}"#).unwrap();
        assert_eq!(parsed.decision.as_deref(), Some("ADD"));
    }

    #[test]
    fn repairs_fenced_json_with_prose() {
        let raw = "Here is my answer:\n```json\n{\"decision\": \"NOT\", \"reason\": \"dup\"}\n```";
        let parsed = repair_decision_json(raw).unwrap();
        assert_eq!(parsed.decision.as_deref(), Some("NOT"));
    }

    #[test]
    fn regex_rescue_on_truncated_json() {
        let raw = r#"{"decision": "REPLACE", "target_run_id": "#;
        let parsed = repair_decision_json(raw).unwrap();
        assert_eq!(parsed.decision.as_deref(), Some("REPLACE"));
    }

    #[test]
    fn repair_fails_on_total_garbage() {
        assert!(repair_decision_json("not json at all, sorry").is_none());
    }

    #[test]
    fn fallback_bullets_uses_first_sentence() {
        let bullets = fallback_bullets("Indexed the corpus. It took a while.", "success");
        assert_eq!(bullets[0], "Indexed the corpus");
        assert_eq!(bullets[1], "Outcome: success");
    }

    #[test]
    fn render_bullets_strips_existing_markers() {
        let rendered = render_bullets(&["- already bulleted".to_string()]);
        assert_eq!(rendered, "• already bulleted");
    }
}
