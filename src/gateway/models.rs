//! Model registry.
//!
//! Centralized per-model data the planner and stages need: the minimum
//! prompt size a provider accepts for context caching, and the published
//! rate limits per billing tier.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Published rate limits for one billing tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierLimits {
    pub tier: &'static str,
    pub requests_per_minute: u32,
    pub tokens_per_minute: Option<u64>,
}

impl TierLimits {
    const fn new(tier: &'static str, rpm: u32, tpm: Option<u64>) -> Self {
        Self {
            tier,
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
        }
    }
}

/// Static facts about a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelProfile {
    /// Provider name.
    pub provider: &'static str,
    /// Smallest prompt (tokens) the provider will cache; `None` = no caching.
    pub min_cache_tokens: Option<u32>,
    /// Rate limits by tier, lowest tier first.
    pub tiers: &'static [TierLimits],
}

impl ModelProfile {
    pub fn supports_caching(&self) -> bool {
        self.min_cache_tokens.is_some()
    }

    /// Limits for `tier`, matched case-insensitively.
    pub fn tier_limits(&self, tier: &str) -> Option<TierLimits> {
        self.tiers
            .iter()
            .find(|t| t.tier.eq_ignore_ascii_case(tier))
            .copied()
    }
}

// =============================================================================
// MODEL DATA
// =============================================================================

// Gemini (verify periodically against the published quota tables)
const GEMINI_FLASH_TIERS: &[TierLimits] = &[
    TierLimits::new("free", 10, Some(250_000)),
    TierLimits::new("tier1", 1_000, Some(1_000_000)),
    TierLimits::new("tier2", 2_000, Some(3_000_000)),
    TierLimits::new("tier3", 10_000, Some(8_000_000)),
];
const GEMINI_FLASH_LITE_TIERS: &[TierLimits] = &[
    TierLimits::new("free", 15, Some(250_000)),
    TierLimits::new("tier1", 4_000, Some(4_000_000)),
    TierLimits::new("tier2", 10_000, Some(10_000_000)),
];
const GEMINI_PRO_TIERS: &[TierLimits] = &[
    TierLimits::new("free", 5, Some(250_000)),
    TierLimits::new("tier1", 150, Some(2_000_000)),
    TierLimits::new("tier2", 1_000, Some(5_000_000)),
    TierLimits::new("tier3", 2_000, Some(8_000_000)),
];

// OpenAI
const OPENAI_MINI_TIERS: &[TierLimits] = &[
    TierLimits::new("tier1", 500, Some(200_000)),
    TierLimits::new("tier2", 5_000, Some(2_000_000)),
];
const OPENAI_FULL_TIERS: &[TierLimits] = &[
    TierLimits::new("tier1", 500, Some(30_000)),
    TierLimits::new("tier2", 5_000, Some(450_000)),
];

// Anthropic
const ANTHROPIC_TIERS: &[TierLimits] = &[
    TierLimits::new("tier1", 50, Some(30_000)),
    TierLimits::new("tier2", 1_000, Some(450_000)),
];

const GEMINI_25_FLASH: ModelProfile = ModelProfile {
    provider: "gemini",
    min_cache_tokens: Some(1_024),
    tiers: GEMINI_FLASH_TIERS,
};
const GEMINI_25_FLASH_LITE: ModelProfile = ModelProfile {
    provider: "gemini",
    min_cache_tokens: Some(1_024),
    tiers: GEMINI_FLASH_LITE_TIERS,
};
const GEMINI_25_PRO: ModelProfile = ModelProfile {
    provider: "gemini",
    min_cache_tokens: Some(4_096),
    tiers: GEMINI_PRO_TIERS,
};
const GEMINI_20_FLASH: ModelProfile = ModelProfile {
    provider: "gemini",
    min_cache_tokens: Some(4_096),
    tiers: GEMINI_FLASH_TIERS,
};
const GPT_5_MINI: ModelProfile = ModelProfile {
    provider: "openai",
    min_cache_tokens: None,
    tiers: OPENAI_MINI_TIERS,
};
const GPT_5: ModelProfile = ModelProfile {
    provider: "openai",
    min_cache_tokens: None,
    tiers: OPENAI_FULL_TIERS,
};
const CLAUDE_SONNET: ModelProfile = ModelProfile {
    provider: "anthropic",
    min_cache_tokens: Some(1_024),
    tiers: ANTHROPIC_TIERS,
};
const CLAUDE_HAIKU: ModelProfile = ModelProfile {
    provider: "anthropic",
    min_cache_tokens: Some(2_048),
    tiers: ANTHROPIC_TIERS,
};

static MODEL_MAP: OnceLock<HashMap<&'static str, ModelProfile>> = OnceLock::new();

fn init_models() -> HashMap<&'static str, ModelProfile> {
    let mut map = HashMap::new();

    map.insert("gemini-2.5-flash", GEMINI_25_FLASH);
    map.insert("gemini-2.5-flash-lite", GEMINI_25_FLASH_LITE);
    map.insert("gemini-2.5-pro", GEMINI_25_PRO);
    map.insert("gemini-2.0-flash", GEMINI_20_FLASH);

    map.insert("gpt-5-mini", GPT_5_MINI);
    map.insert("gpt-5-nano", GPT_5_MINI);
    map.insert("gpt-5", GPT_5);

    map.insert("claude-sonnet-4-5", CLAUDE_SONNET);
    map.insert("claude-haiku-4-5", CLAUDE_HAIKU);

    map
}

/// Get the profile for a model, ignoring a `provider/` or `models/` prefix.
pub fn model_profile(model_id: &str) -> Option<ModelProfile> {
    let map = MODEL_MAP.get_or_init(init_models);
    let bare = model_id.rsplit('/').next().unwrap_or(model_id);
    map.get(bare).copied()
}

/// Minimum cacheable prompt size for a model, if it supports caching.
pub fn min_cache_tokens(model_id: &str) -> Option<u32> {
    model_profile(model_id).and_then(|p| p.min_cache_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_strips_prefixes() {
        assert!(model_profile("models/gemini-2.5-flash").is_some());
        assert!(model_profile("openai/gpt-5-mini").is_some());
        assert!(model_profile("unknown-model").is_none());
    }

    #[test]
    fn tier_lookup_is_case_insensitive() {
        let profile = model_profile("gemini-2.5-pro").unwrap();
        let limits = profile.tier_limits("TIER1").unwrap();
        assert_eq!(limits.requests_per_minute, 150);
        assert_eq!(limits.tokens_per_minute, Some(2_000_000));
        assert!(profile.tier_limits("enterprise").is_none());
    }

    #[test]
    fn cache_floor_reflects_model() {
        assert_eq!(min_cache_tokens("gemini-2.5-flash"), Some(1_024));
        assert_eq!(min_cache_tokens("gemini-2.5-pro"), Some(4_096));
        assert_eq!(min_cache_tokens("gpt-5-mini"), None);
    }
}
