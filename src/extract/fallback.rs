//! Tier-2 fallback. Always returns exactly `expected` answers.

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use serde_json::Value;

use super::{normalize, parse_json_array, strip_answer_prefix};

// A numbered item runs until the next numbered item or the end of text.
static NUMBERED_ITEM: Lazy<FancyRegex> = Lazy::new(|| {
    FancyRegex::new(r"(?ms)^\s*\d+[.)]\s+(.*?)\s*(?=^\s*\d+[.)]\s|\z)")
        .expect("valid numbered item regex")
});

fn text_of(raw: Option<&Value>) -> String {
    match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn numbered_items(text: &str) -> Vec<String> {
    NUMBERED_ITEM
        .captures_iter(text)
        .filter_map(|caps| caps.ok())
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// Infallible extraction. Returns the answers and the step that produced
/// them: `json_array`, `numbered_list`, `lines` or `whole_text`.
pub fn extract(raw: Option<&Value>, expected: usize) -> (Vec<String>, &'static str) {
    let text = text_of(raw);

    let (mut answers, step) = if let Some(items) = parse_json_array(&text) {
        (items.iter().map(normalize).collect(), "json_array")
    } else {
        let numbered = numbered_items(&text);
        let lines: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if expected > 1 && numbered.len() > 1 {
            (numbered, "numbered_list")
        } else if expected > 1 && lines.len() > 1 {
            (lines, "lines")
        } else if text.trim().is_empty() {
            (Vec::new(), "whole_text")
        } else {
            (vec![strip_answer_prefix(&text)], "whole_text")
        }
    };

    answers.resize(expected, String::new());
    (answers, step)
}
