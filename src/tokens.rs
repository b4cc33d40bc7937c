//! Token estimation.
//!
//! Pure functions mapping sources and prompts to an expected token range
//! with a confidence score. Text is counted with the cl100k tokenizer when
//! it is at hand; everything else uses per-content-type heuristics, then a
//! provider bias factor corrects for tokenizer differences.

use once_cell::sync::Lazy;
use serde::Serialize;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::source::{Source, SourceKind};

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Fixed cost of one image.
pub const IMAGE_TOKENS: u64 = 258;
/// Tokens per PDF page.
pub const PDF_TOKENS_PER_PAGE: u64 = 258;
/// Tokens per second of video (frames plus audio track).
pub const VIDEO_TOKENS_PER_SECOND: u64 = 263;
pub const AUDIO_TOKENS_PER_SECOND: u64 = 32;

const BYTES_PER_TEXT_TOKEN: u64 = 4;
const PDF_BYTES_PER_PAGE: u64 = 50_000;
const VIDEO_BYTES_PER_SECOND: u64 = 250_000;
const AUDIO_BYTES_PER_SECOND: u64 = 16_000;
/// Length assumed for a remote video of unknown size.
const DEFAULT_VIDEO_SECONDS: u64 = 600;
const DEFAULT_PDF_PAGES: u64 = 10;

/// One line of an estimate's breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBreakdown {
    pub label: String,
    pub expected: u64,
}

/// Expected token range for some content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEstimate {
    pub min: u64,
    pub expected: u64,
    pub max: u64,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub breakdown: Vec<TokenBreakdown>,
}

impl Default for TokenEstimate {
    fn default() -> Self {
        Self::exact(0)
    }
}

impl TokenEstimate {
    pub fn exact(tokens: u64) -> Self {
        Self {
            min: tokens,
            expected: tokens,
            max: tokens,
            confidence: 1.0,
            breakdown: Vec::new(),
        }
    }

    fn ranged(expected: u64, spread: f64, confidence: f64) -> Self {
        Self {
            min: ((expected as f64) * (1.0 - spread)).floor().max(0.0) as u64,
            expected,
            max: ((expected as f64) * (1.0 + spread)).ceil() as u64,
            confidence: confidence.clamp(0.0, 1.0),
            breakdown: Vec::new(),
        }
    }

    fn labelled(mut self, label: impl Into<String>) -> Self {
        self.breakdown = vec![TokenBreakdown {
            label: label.into(),
            expected: self.expected,
        }];
        self
    }

    /// Sum of two estimates; confidence is weighted by expected tokens.
    pub fn combine(mut self, other: TokenEstimate) -> Self {
        let total = self.expected + other.expected;
        self.confidence = if total == 0 {
            self.confidence.min(other.confidence)
        } else {
            (self.confidence * self.expected as f64 + other.confidence * other.expected as f64)
                / total as f64
        };
        self.min += other.min;
        self.expected = total;
        self.max += other.max;
        self.breakdown.extend(other.breakdown);
        self
    }

    /// The same content sent `times` times.
    pub fn repeated(&self, times: u64) -> Self {
        Self {
            min: self.min * times,
            expected: self.expected * times,
            max: self.max * times,
            confidence: self.confidence,
            breakdown: self.breakdown.clone(),
        }
    }

    fn scaled(mut self, factor: f64) -> Self {
        let scale = |v: u64| ((v as f64) * factor).round() as u64;
        self.min = scale(self.min);
        self.expected = scale(self.expected);
        self.max = scale(self.max);
        for line in &mut self.breakdown {
            line.expected = scale(line.expected);
        }
        self
    }
}

/// Count tokens in text with cl100k, or bytes/4 if the tokenizer is missing.
pub fn count_tokens(text: &str) -> u64 {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => (text.len() as u64).div_ceil(BYTES_PER_TEXT_TOKEN),
    }
}

/// Multiplier correcting cl100k-based counts for a provider's tokenizer.
pub fn provider_bias(provider: &str) -> f64 {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => 1.05,
        "anthropic" | "claude" => 1.15,
        "openai" | "openrouter" => 1.0,
        _ => 1.1,
    }
}

/// Heuristic estimate for one source, before provider bias.
pub fn estimate_source(source: &Source) -> TokenEstimate {
    let mime = source.mime_type.as_str();
    let size = source.size_bytes;

    let estimate = if source.kind == SourceKind::Youtube || mime.starts_with("video/") {
        let seconds = if size > 0 {
            (size / VIDEO_BYTES_PER_SECOND).max(1)
        } else {
            DEFAULT_VIDEO_SECONDS
        };
        let confidence = if size > 0 { 0.5 } else { 0.2 };
        TokenEstimate::ranged(seconds * VIDEO_TOKENS_PER_SECOND, 0.8, confidence)
    } else if mime.starts_with("audio/") {
        let seconds = (size / AUDIO_BYTES_PER_SECOND).max(1);
        TokenEstimate::ranged(seconds * AUDIO_TOKENS_PER_SECOND, 0.5, 0.5)
    } else if mime.starts_with("image/") {
        TokenEstimate {
            min: 85,
            expected: IMAGE_TOKENS,
            max: 1_500,
            confidence: 0.8,
            breakdown: Vec::new(),
        }
    } else if mime == "application/pdf" {
        let (pages, confidence) = if size > 0 {
            ((size / PDF_BYTES_PER_PAGE).max(1), 0.5)
        } else {
            (DEFAULT_PDF_PAGES, 0.3)
        };
        TokenEstimate::ranged(pages * PDF_TOKENS_PER_PAGE, 0.6, confidence)
    } else if source.is_text() {
        let confidence = if source.kind == SourceKind::Text { 0.9 } else { 0.8 };
        TokenEstimate::ranged(size.div_ceil(BYTES_PER_TEXT_TOKEN), 0.25, confidence)
    } else if source.kind.is_remote() && size == 0 {
        TokenEstimate::ranged(1_000, 0.9, 0.1)
    } else {
        TokenEstimate::ranged(size.div_ceil(BYTES_PER_TEXT_TOKEN), 0.5, 0.4)
    };

    estimate.labelled(format!("{}:{}", source.kind.as_str(), source.identifier))
}

/// Estimate for shared context: every source plus rendered history.
pub fn estimate_context(provider: &str, sources: &[Source], history_text: &str) -> TokenEstimate {
    let mut total = TokenEstimate::exact(0);
    for source in sources {
        total = total.combine(estimate_source(source));
    }
    if !history_text.is_empty() {
        total = total.combine(TokenEstimate::exact(count_tokens(history_text)).labelled("history"));
    }
    total.scaled(provider_bias(provider))
}

/// Estimate for a vectorized plan: the context travels with every call.
pub fn estimate_plan(provider: &str, context: &TokenEstimate, prompts: &[String]) -> TokenEstimate {
    let calls = prompts.len().max(1) as u64;
    let mut total = context.repeated(calls);
    for (i, prompt) in prompts.iter().enumerate() {
        let tokens = count_tokens(prompt);
        total = total.combine(
            TokenEstimate::exact(tokens)
                .labelled(format!("prompt:{i}"))
                .scaled(provider_bias(provider)),
        );
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_text_counts() {
        assert_eq!(count_tokens(""), 0);
        assert!(count_tokens("hello world") >= 2);
    }

    #[test]
    fn images_use_fixed_cost() {
        let source = Source::with_loader(
            SourceKind::File,
            "cat.png",
            "image/png",
            2_000_000,
            crate::source::bytes_loader(Vec::new()),
        );
        let est = estimate_source(&source);
        assert_eq!(est.expected, IMAGE_TOKENS);
        assert!(est.min <= est.expected && est.expected <= est.max);
    }

    #[test]
    fn youtube_without_size_has_low_confidence() {
        let source = Source::youtube("https://youtu.be/dQw4w9WgXcQ").unwrap();
        let est = estimate_source(&source);
        assert_eq!(est.expected, DEFAULT_VIDEO_SECONDS * VIDEO_TOKENS_PER_SECOND);
        assert!(est.confidence < 0.5);
    }

    #[test]
    fn combine_weights_confidence() {
        let a = TokenEstimate::exact(100);
        let b = TokenEstimate::ranged(100, 0.5, 0.5);
        let sum = a.combine(b);
        assert_eq!(sum.expected, 200);
        assert!((sum.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn plan_estimate_repeats_context_per_call() {
        let context = TokenEstimate::exact(1_000);
        let prompts = vec!["Q1".to_string(), "Q2".to_string()];
        let est = estimate_plan("openai", &context, &prompts);
        assert!(est.expected >= 2_000);
        assert!(est.expected < 2_100);
    }
}
