//! Result reducer: a two-tier transform chain.
//!
//! Tier 1 is an ordered set of named transforms tried in descending
//! priority (ties broken by name) until one matches and extracts. Tier 2
//! is an infallible fallback that always yields exactly the expected
//! number of answers. Contract violations become diagnostics; extraction
//! itself never fails once a response exists.

pub mod fallback;
pub mod transforms;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::command::ResultContract;

pub use transforms::{
    BatchResponseTransform, JsonArrayTransform, MarkdownListTransform, PlainTextTransform,
    ProviderStructureTransform,
};

// =============================================================================
// TYPES
// =============================================================================

/// Inputs every transform sees besides the raw value.
#[derive(Debug, Clone, Default)]
pub struct ExtractionContext {
    pub expected_count: usize,
    pub prefer_json_array: bool,
}

/// What a transform produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub answers: Vec<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub structured: Option<Vec<Value>>,
}

impl Extraction {
    pub fn new(answers: Vec<String>, confidence: f64) -> Self {
        Self {
            answers,
            confidence,
            structured: None,
        }
    }

    pub fn with_structured(mut self, structured: Vec<Value>) -> Self {
        self.structured = Some(structured);
        self
    }
}

/// A Tier-1 extraction strategy.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher runs first. May depend on caller hints.
    fn priority(&self, ctx: &ExtractionContext) -> i32;

    fn matches(&self, raw: &Value, ctx: &ExtractionContext) -> bool;

    /// `Err` declines after a match; the chain moves on.
    fn extract(&self, raw: &Value, ctx: &ExtractionContext) -> Result<Extraction, String>;
}

/// Final reducer output.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub answers: Vec<String>,
    pub structured: Option<Vec<Value>>,
    /// Name of the transform that produced the answers.
    pub method: String,
    pub confidence: f64,
    pub diagnostics: Vec<Value>,
}

// =============================================================================
// REDUCER
// =============================================================================

/// The transform chain.
pub struct ResultReducer {
    transforms: Vec<Box<dyn Transform>>,
}

impl Default for ResultReducer {
    fn default() -> Self {
        Self::new(vec![
            Box::new(ProviderStructureTransform),
            Box::new(BatchResponseTransform),
            Box::new(JsonArrayTransform),
            Box::new(MarkdownListTransform),
            Box::new(PlainTextTransform),
        ])
    }
}

impl ResultReducer {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    /// Transforms in the order they will be tried.
    pub fn order(&self, ctx: &ExtractionContext) -> Vec<&'static str> {
        self.ordered(ctx).iter().map(|t| t.name()).collect()
    }

    fn ordered(&self, ctx: &ExtractionContext) -> Vec<&dyn Transform> {
        let mut ordered: Vec<&dyn Transform> = self.transforms.iter().map(|t| t.as_ref()).collect();
        ordered.sort_by(|a, b| {
            b.priority(ctx)
                .cmp(&a.priority(ctx))
                .then_with(|| a.name().cmp(b.name()))
        });
        ordered
    }

    /// Reduce a raw provider value to answers. Never fails.
    pub fn reduce(
        &self,
        raw: Option<&Value>,
        ctx: &ExtractionContext,
        contract: Option<&ResultContract>,
    ) -> Reduction {
        let mut diagnostics = Vec::new();

        let tier1 = raw.and_then(|raw| {
            self.ordered(ctx).into_iter().find_map(|transform| {
                if !transform.matches(raw, ctx) {
                    return None;
                }
                match transform.extract(raw, ctx) {
                    Ok(extraction) => Some((transform.name(), extraction)),
                    Err(reason) => {
                        diagnostics.push(json!({
                            "event": "transform_declined",
                            "transform": transform.name(),
                            "reason": reason,
                        }));
                        None
                    }
                }
            })
        });

        let (method, mut extraction) = match tier1 {
            Some((name, extraction)) => (name.to_string(), extraction),
            None => {
                let (answers, step) = fallback::extract(raw, ctx.expected_count);
                (format!("fallback:{step}"), Extraction::new(answers, 0.1))
            }
        };

        if let Some(contract) = contract {
            diagnostics.extend(validate_contract(&extraction, contract));
        }

        let produced = extraction.answers.len();
        if produced != ctx.expected_count {
            tracing::warn!(
                method = %method,
                expected = ctx.expected_count,
                produced,
                "answer count mismatch"
            );
            diagnostics.push(json!({
                "event": "answer_count_mismatch",
                "method": method,
                "expected": ctx.expected_count,
                "produced": produced,
            }));
            extraction.answers.resize(ctx.expected_count, String::new());
            if let Some(structured) = extraction.structured.as_mut() {
                structured.resize(ctx.expected_count, Value::Null);
            }
        }

        Reduction {
            answers: extraction.answers,
            structured: extraction.structured,
            method,
            confidence: extraction.confidence,
            diagnostics,
        }
    }
}

/// Check an extraction against a contract. Violations are diagnostics.
pub fn validate_contract(extraction: &Extraction, contract: &ResultContract) -> Vec<Value> {
    let mut violations = Vec::new();
    let mut violation = |rule: &str, detail: Value| {
        tracing::warn!(rule, %detail, "result contract violation");
        violations.push(json!({"event": "contract_violation", "rule": rule, "detail": detail}));
    };

    if let Some(expected) = contract.expected_count {
        if extraction.answers.len() != expected {
            violation(
                "expected_count",
                json!({"expected": expected, "actual": extraction.answers.len()}),
            );
        }
    }
    for (i, answer) in extraction.answers.iter().enumerate() {
        let len = answer.chars().count();
        if contract.min_answer_len.is_some_and(|min| len < min) {
            violation("min_answer_len", json!({"index": i, "len": len}));
        }
        if contract.max_answer_len.is_some_and(|max| len > max) {
            violation("max_answer_len", json!({"index": i, "len": len}));
        }
    }
    if !contract.required_fields.is_empty() {
        let payloads = extraction.structured.as_deref().unwrap_or(&[]);
        if payloads.is_empty() {
            violation("required_fields", json!({"missing": "structured payload"}));
        }
        for (i, payload) in payloads.iter().enumerate() {
            let missing: Vec<&str> = contract
                .required_fields
                .iter()
                .filter(|f| payload.get(f.as_str()).is_none())
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                violation("required_fields", json!({"index": i, "missing": missing}));
            }
        }
    }
    violations
}

// =============================================================================
// SHARED HELPERS
// =============================================================================

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("valid fenced block regex")
});

static ANSWER_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(final answer|answer|response|a)\s*:\s*").expect("valid prefix regex")
});

/// Text carried by a raw value, if it is text-like.
pub(crate) fn value_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("text").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Strip a leading "Answer:"-style prefix.
pub(crate) fn strip_answer_prefix(text: &str) -> String {
    ANSWER_PREFIX.replace(text.trim(), "").trim().to_string()
}

/// Render a JSON scalar as an answer string.
pub(crate) fn normalize(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Parse a JSON array directly or from a fenced code block.
pub(crate) fn parse_json_array(text: &str) -> Option<Vec<Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return Some(items);
    }
    FENCED_BLOCK.captures_iter(trimmed).find_map(|caps| {
        let body = caps.get(1)?.as_str().trim();
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        }
    })
}
