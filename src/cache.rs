//! Cache identity for shared-context provider caches.
//!
//! The key is derived from content hashes, never from identifiers or byte
//! sizes alone: two files with the same name and size but different bytes
//! must not share a cache.

use serde::Serialize;

use crate::error::PipelineError;
use crate::source::Source;

/// Deterministic identity of a shared context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheIdentityKey {
    pub model: String,
    pub system_instruction_hash: String,
    pub history_hash: String,
    /// One entry per source, in source order.
    pub source_hashes: Vec<String>,
    pub key_hash: String,
}

impl CacheIdentityKey {
    /// Build the key from already-computed source content hashes.
    pub fn new(
        model: &str,
        system_instruction: Option<&str>,
        history_text: &str,
        source_hashes: Vec<String>,
    ) -> Self {
        let system_instruction_hash = hash_text(system_instruction.unwrap_or(""));
        let history_hash = hash_text(history_text);
        let sources_hash = hash_fields(
            &source_hashes
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>(),
        );
        let key_hash = hash_fields(&[
            "v1",
            model,
            &system_instruction_hash,
            &history_hash,
            &sources_hash,
        ]);

        Self {
            model: model.to_string(),
            system_instruction_hash,
            history_hash,
            source_hashes,
            key_hash,
        }
    }

    /// Hash every source's content, then build the key.
    pub async fn for_sources(
        model: &str,
        system_instruction: Option<&str>,
        history_text: &str,
        sources: &[Source],
    ) -> Result<Self, PipelineError> {
        let mut source_hashes = Vec::with_capacity(sources.len());
        for source in sources {
            // Kind and MIME type are part of the identity: the same bytes
            // sent as text versus as a PDF produce different caches.
            let content = source.content_hash().await?;
            source_hashes.push(hash_fields(&[
                source.kind.as_str(),
                &source.mime_type,
                &content,
            ]));
        }
        Ok(Self::new(
            model,
            system_instruction,
            history_text,
            source_hashes,
        ))
    }

    /// Key for an explicit caller-supplied identity, scoped by model.
    pub fn from_override(model: &str, override_key: &str) -> String {
        hash_fields(&["override", model, override_key])
    }
}

pub(crate) fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub(crate) fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
