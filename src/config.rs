//! Engine configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::materialize::RemoteFilePolicy;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "BATCHLINE_";

/// Engine-wide settings for one executor.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `gemini` | `openai` | `anthropic` | `openrouter` | `mock`.
    pub provider: String,
    pub model: String,
    /// Resolved from the provider's env var when absent.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// `false` runs against the deterministic mock adapter.
    pub use_real_api: bool,
    pub enable_caching: bool,
    pub ttl_seconds: u64,
    /// Billing tier used for rate limits.
    pub tier: String,
    /// Upper bound on concurrent provider calls per invocation.
    pub request_concurrency: usize,
    pub retry: RetryPolicy,
    pub remote_files: RemoteFilePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key: None,
            use_real_api: false,
            enable_caching: false,
            ttl_seconds: 3_600,
            tier: "free".to_string(),
            request_concurrency: 6,
            retry: RetryPolicy::default(),
            remote_files: RemoteFilePolicy::default(),
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("use_real_api", &self.use_real_api)
            .field("enable_caching", &self.enable_caching)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("tier", &self.tier)
            .field("request_concurrency", &self.request_concurrency)
            .field("retry", &self.retry)
            .field("remote_files", &self.remote_files)
            .finish()
    }
}

/// Env var holding the API key for `provider`.
pub fn provider_key_var(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => Some("GEMINI_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn number<T: std::str::FromStr>(
    name: &str,
    raw: Option<String>,
) -> Result<Option<T>, PipelineError> {
    raw.map(|raw| {
        raw.trim().parse().map_err(|_| {
            PipelineError::configuration(format!("{ENV_PREFIX}{name}: not a number: {raw}"))
        })
    })
    .transpose()
}

impl EngineConfig {
    /// Read `BATCHLINE_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injected variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let flag = |name: &str| -> Result<Option<bool>, PipelineError> {
            match var(name) {
                None => Ok(None),
                Some(raw) => parse_bool(&raw).map(Some).ok_or_else(|| {
                    PipelineError::configuration(format!("{ENV_PREFIX}{name}: not a boolean: {raw}"))
                }),
            }
        };

        let mut config = Self::default();
        if let Some(provider) = var("PROVIDER") {
            config.provider = provider;
        }
        if let Some(model) = var("MODEL") {
            config.model = model;
        }
        config.api_key = var("API_KEY");
        if let Some(v) = flag("USE_REAL_API")? {
            config.use_real_api = v;
        }
        if let Some(v) = flag("ENABLE_CACHING")? {
            config.enable_caching = v;
        }
        if let Some(v) = number("TTL_SECONDS", var("TTL_SECONDS"))? {
            config.ttl_seconds = v;
        }
        if let Some(tier) = var("TIER") {
            config.tier = tier;
        }
        if let Some(v) = number("REQUEST_CONCURRENCY", var("REQUEST_CONCURRENCY"))? {
            config.request_concurrency = v;
        }
        if let Some(v) = number("RETRY_MAX_ATTEMPTS", var("RETRY_MAX_ATTEMPTS"))? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = flag("REMOTE_FILES")? {
            config.remote_files.enabled = v;
        }

        if config.api_key.is_none() {
            config.api_key = provider_key_var(&config.provider).and_then(|name| lookup(name));
        }
        Ok(config)
    }

    /// Fail fast on setups that cannot run.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::configuration("model must not be empty"));
        }
        if self.request_concurrency == 0 {
            return Err(PipelineError::configuration(
                "request_concurrency must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::configuration(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.use_real_api && self.api_key.as_deref().map_or(true, str::is_empty) {
            let hint = provider_key_var(&self.provider)
                .map(|v| format!(" (set {v} or {ENV_PREFIX}API_KEY)"))
                .unwrap_or_default();
            return Err(PipelineError::configuration(format!(
                "no API key for provider {}{hint}",
                self.provider
            )));
        }
        self.remote_files.validate()
    }
}
