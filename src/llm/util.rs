//! Text helpers shared by LLM-facing components

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref JSON_FENCE: Regex =
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\}|\[.*?\])\s*```").expect("static regex");
}

/// Extract a JSON object or array from raw model output
///
/// Models frequently wrap JSON in markdown fences or surround it with prose.
/// Tries, in order: a fenced ```json block, then the widest brace-delimited
/// span, then the widest bracket-delimited span. Returns the candidate text;
/// the caller parses it.
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();

    if let Some(caps) = JSON_FENCE.captures(trimmed) {
        return caps.get(1).map(|m| m.as_str());
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                return Some(&trimmed[start..=end]);
            }
        }
    }

    None
}

/// Truncate text to a bounded preview on a char boundary, appending an
/// ellipsis marker when content was dropped
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}...", truncated.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_fenced_json() {
        let output = "Here is the plan:\n```json\n{\"nextStep\": \"check calendar\"}\n```\nDone.";
        assert_eq!(
            extract_json_block(output),
            Some(r#"{"nextStep": "check calendar"}"#)
        );
    }

    #[test]
    fn test_extracts_bare_object() {
        let output = "Sure! {\"isComplete\": true} is my answer.";
        assert_eq!(extract_json_block(output), Some(r#"{"isComplete": true}"#));
    }

    #[test]
    fn test_extracts_array() {
        let output = "[{\"type\": \"add_step\"}]";
        assert_eq!(extract_json_block(output), Some(r#"[{"type": "add_step"}]"#));
    }

    #[test]
    fn test_no_json_yields_none() {
        assert_eq!(extract_json_block("no structured content here"), None);
    }

    #[test]
    fn test_truncate_preview() {
        assert_eq!(truncate_preview("short", 10), "short");
        let long = "a".repeat(20);
        let preview = truncate_preview(&long, 10);
        assert!(preview.starts_with("aaaaaaaaaa"));
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_truncate_preview_multibyte_boundary() {
        let text = "héllo wörld, this gets cut";
        let preview = truncate_preview(text, 8);
        assert!(preview.ends_with("..."));
    }
}
