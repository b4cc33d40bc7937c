//! Deterministic adapter for dry runs and tests.
//!
//! Echoes prompts back as answers, reports synthetic usage, and supports
//! uploads and caching so every pipeline stage can run without a network.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::error::ApiError;
use super::types::{Capabilities, FileRef, GenerateResponse, GenerationConfig, Part, Usage};
use super::ProviderAdapter;

/// Dry-run adapter.
#[derive(Debug)]
pub struct MockAdapter {
    capabilities: Capabilities,
    generate_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    cache_calls: AtomicUsize,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::all())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            generate_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            cache_calls: AtomicUsize::new(0),
        }
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn cache_calls(&self) -> usize {
        self.cache_calls.load(Ordering::SeqCst)
    }
}

/// Rough token count for synthetic usage (4 bytes per token).
fn synthetic_tokens(parts: &[Part]) -> u64 {
    parts
        .iter()
        .map(|p| match p {
            Part::Text { text } => (text.len() as u64).div_ceil(4),
            Part::Inline { data, .. } => (data.len() as u64).div_ceil(4),
            _ => 258,
        })
        .sum()
}

fn short_hash(input: &str) -> String {
    let hash = blake3::hash(input.as_bytes()).to_hex();
    hash[..16].to_string()
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn generate(
        &self,
        model: &str,
        parts: &[Part],
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ApiError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);

        // The prompt is always the last text part.
        let prompt = parts.iter().rev().find_map(Part::as_text).unwrap_or("");
        let text = format!("echo: {prompt}");

        let prompt_tokens = synthetic_tokens(parts);
        let completion_tokens = (text.len() as u64).div_ceil(4);
        let mut usage = Usage::new(prompt_tokens, completion_tokens);
        if config.cached_content.is_some() {
            usage.cached_tokens = Some(0);
        }

        let mut resp = GenerateResponse::text(text, usage);
        resp.response_id = Some(format!("mock-{}", short_hash(&format!("{model}|{prompt}"))));
        Ok(resp)
    }

    async fn upload(&self, path: &Path, mime_type: &str) -> Result<FileRef, ApiError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}|{mime_type}", path.display());
        Ok(FileRef::new(format!("files/{}", short_hash(&key))))
    }

    async fn create_cache(
        &self,
        model: &str,
        parts: &[Part],
        system_instruction: Option<&str>,
        _ttl: Duration,
    ) -> Result<String, ApiError> {
        self.cache_calls.fetch_add(1, Ordering::SeqCst);
        let parts_json = serde_json::to_string(parts).unwrap_or_default();
        let key = format!("{model}|{}|{parts_json}", system_instruction.unwrap_or(""));
        Ok(format!("cachedContents/{}", short_hash(&key)))
    }
}
