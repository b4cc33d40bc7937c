//! Tier-1 transforms.

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use serde_json::Value;

use super::{
    normalize, parse_json_array, strip_answer_prefix, value_text, Extraction, ExtractionContext,
    Transform,
};

// Bullets or numbered items; `---` style rules are not items.
static LIST_ITEM: Lazy<FancyRegex> = Lazy::new(|| {
    FancyRegex::new(r"^\s*(?:\d+[.)]|[-*•](?![-*]))\s+(.+?)\s*$").expect("valid list item regex")
});

/// Items of a markdown list, in order. Non-item lines are ignored.
pub(crate) fn list_items(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let caps = LIST_ITEM.captures(line).ok()??;
            caps.get(1).map(|m| m.as_str().to_string())
        })
        .collect()
}

/// Text from the common provider payload shapes.
fn provider_text(raw: &Value) -> Option<String> {
    // Gemini: candidates[0].content.parts[].text
    if let Some(parts) = raw
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        let text: Vec<&str> = parts.iter().filter_map(|p| p.get("text")?.as_str()).collect();
        return (!text.is_empty()).then(|| text.concat());
    }
    // OpenAI-style chat completions.
    if let Some(content) = raw.pointer("/choices/0/message/content") {
        return content.as_str().map(str::to_string);
    }
    // Anthropic-style content blocks.
    if let Some(blocks) = raw.get("content").and_then(Value::as_array) {
        let text: Vec<&str> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text")?.as_str())
            .collect();
        return (!text.is_empty()).then(|| text.join("\n"));
    }
    value_text(raw)
}

fn is_provider_payload(raw: &Value) -> bool {
    let Some(map) = raw.as_object() else {
        return false;
    };
    map.contains_key("candidates")
        || map.contains_key("choices")
        || map.get("content").is_some_and(Value::is_array)
        || map.contains_key("structured")
        || map.get("text").is_some_and(Value::is_string)
}

// =============================================================================
// PROVIDER STRUCTURE
// =============================================================================

/// Walks provider payloads (candidates, choices, content blocks).
pub struct ProviderStructureTransform;

impl Transform for ProviderStructureTransform {
    fn name(&self) -> &'static str {
        "provider_structure"
    }

    fn priority(&self, _ctx: &ExtractionContext) -> i32 {
        90
    }

    fn matches(&self, raw: &Value, _ctx: &ExtractionContext) -> bool {
        is_provider_payload(raw)
    }

    fn extract(&self, raw: &Value, ctx: &ExtractionContext) -> Result<Extraction, String> {
        let structured = raw.get("structured").filter(|s| !s.is_null()).cloned();
        let text = provider_text(raw);
        if text.is_none() && structured.is_none() {
            return Err("provider payload carries no text".to_string());
        }
        let text = text.unwrap_or_default();

        let answers = if ctx.expected_count > 1 {
            if let Some(items) = parse_json_array(&text) {
                items.iter().map(normalize).collect()
            } else {
                let items = list_items(&text);
                if items.len() > 1 {
                    items
                } else {
                    vec![strip_answer_prefix(&text)]
                }
            }
        } else {
            vec![strip_answer_prefix(&text)]
        };

        let extraction = Extraction::new(answers, 0.95);
        Ok(match structured {
            Some(s) => extraction.with_structured(vec![s]),
            None => extraction,
        })
    }
}

// =============================================================================
// BATCH RESPONSE
// =============================================================================

/// `{"batch": [...]}`, one element per call.
pub struct BatchResponseTransform;

impl Transform for BatchResponseTransform {
    fn name(&self) -> &'static str {
        "batch_response"
    }

    fn priority(&self, _ctx: &ExtractionContext) -> i32 {
        95
    }

    fn matches(&self, raw: &Value, _ctx: &ExtractionContext) -> bool {
        raw.get("batch").is_some_and(Value::is_array)
    }

    fn extract(&self, raw: &Value, _ctx: &ExtractionContext) -> Result<Extraction, String> {
        let items = raw
            .get("batch")
            .and_then(Value::as_array)
            .ok_or_else(|| "batch is not an array".to_string())?;

        let mut answers = Vec::with_capacity(items.len());
        let mut structured = Vec::with_capacity(items.len());
        let mut missing = 0usize;
        for item in items {
            match provider_text(item) {
                Some(text) => answers.push(strip_answer_prefix(&text)),
                None => {
                    missing += 1;
                    answers.push(String::new());
                }
            }
            structured.push(item.get("structured").cloned().unwrap_or(Value::Null));
        }

        let confidence = if items.is_empty() {
            0.5
        } else {
            0.9 * (items.len() - missing) as f64 / items.len() as f64
        };
        let extraction = Extraction::new(answers, confidence);
        Ok(if structured.iter().any(|s| !s.is_null()) {
            extraction.with_structured(structured)
        } else {
            extraction
        })
    }
}

// =============================================================================
// JSON ARRAY
// =============================================================================

/// A JSON array, bare or inside a fenced block.
pub struct JsonArrayTransform;

impl JsonArrayTransform {
    fn items(raw: &Value) -> Option<Vec<Value>> {
        match raw {
            Value::Array(items) => Some(items.clone()),
            other => parse_json_array(&value_text(other)?),
        }
    }
}

impl Transform for JsonArrayTransform {
    fn name(&self) -> &'static str {
        "json_array"
    }

    fn priority(&self, ctx: &ExtractionContext) -> i32 {
        if ctx.prefer_json_array {
            100
        } else {
            80
        }
    }

    // A single answer that happens to be an array stays whole unless asked.
    fn matches(&self, raw: &Value, ctx: &ExtractionContext) -> bool {
        let wanted = ctx.expected_count > 1 || ctx.prefer_json_array || raw.is_array();
        wanted && Self::items(raw).is_some()
    }

    fn extract(&self, raw: &Value, _ctx: &ExtractionContext) -> Result<Extraction, String> {
        let items = Self::items(raw).ok_or_else(|| "no JSON array found".to_string())?;
        let answers = items.iter().map(normalize).collect();
        let extraction = Extraction::new(answers, 0.85);
        Ok(if items.iter().any(Value::is_object) {
            extraction.with_structured(items)
        } else {
            extraction
        })
    }
}

// =============================================================================
// MARKDOWN LIST
// =============================================================================

/// Numbered or bulleted markdown lists.
pub struct MarkdownListTransform;

impl Transform for MarkdownListTransform {
    fn name(&self) -> &'static str {
        "markdown_list"
    }

    fn priority(&self, _ctx: &ExtractionContext) -> i32 {
        50
    }

    fn matches(&self, raw: &Value, ctx: &ExtractionContext) -> bool {
        ctx.expected_count > 1 && value_text(raw).is_some_and(|text| list_items(&text).len() >= 2)
    }

    fn extract(&self, raw: &Value, _ctx: &ExtractionContext) -> Result<Extraction, String> {
        let text = value_text(raw).ok_or_else(|| "not text".to_string())?;
        let items = list_items(&text);
        if items.is_empty() {
            return Err("no list items".to_string());
        }
        Ok(Extraction::new(items, 0.7))
    }
}

// =============================================================================
// PLAIN TEXT
// =============================================================================

/// Whole text as a single answer.
pub struct PlainTextTransform;

impl Transform for PlainTextTransform {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn priority(&self, _ctx: &ExtractionContext) -> i32 {
        10
    }

    fn matches(&self, raw: &Value, _ctx: &ExtractionContext) -> bool {
        value_text(raw).is_some()
    }

    fn extract(&self, raw: &Value, _ctx: &ExtractionContext) -> Result<Extraction, String> {
        let text = value_text(raw).ok_or_else(|| "not text".to_string())?;
        Ok(Extraction::new(vec![strip_answer_prefix(&text)], 0.5))
    }
}
