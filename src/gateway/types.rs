//! Core types exchanged with provider adapters.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// CONTENT PARTS
// =============================================================================

/// Opaque reference to a file uploaded to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef(pub String);

impl FileRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One ordered piece of content sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// Local file still waiting to be uploaded.
    File { path: PathBuf, mime_type: String },
    /// Remote reference the provider can fetch itself (YouTube, http).
    Uri { uri: String, mime_type: String },
    /// File already uploaded to the provider.
    Uploaded { file: FileRef, mime_type: String },
    /// Raw bytes sent inline with the request.
    Inline {
        #[serde(skip)]
        data: Vec<u8>,
        mime_type: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn file(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Part::File {
            path: path.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn uri(uri: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Part::Uri {
            uri: uri.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Part::Text { .. } => "text/plain",
            Part::File { mime_type, .. }
            | Part::Uri { mime_type, .. }
            | Part::Uploaded { mime_type, .. }
            | Part::Inline { mime_type, .. } => mime_type,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    /// True for local files that still need an upload reference.
    pub fn is_pending_file(&self) -> bool {
        matches!(self, Part::File { .. })
    }
}

// =============================================================================
// GENERATION CONFIG
// =============================================================================

/// Provider-neutral generation settings attached to every call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// JSON schema for structured output (requires the capability).
    #[serde(default)]
    pub response_schema: Option<Value>,
    /// Reasoning effort ("low" | "medium" | "high") for reasoning models.
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    /// Provider cache to read shared context from.
    #[serde(default)]
    pub cached_content: Option<String>,
}

impl GenerationConfig {
    pub fn with_cached_content(mut self, name: impl Into<String>) -> Self {
        self.cached_content = Some(name.into());
        self
    }
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Explicit capability flags each adapter declares.
///
/// The pipeline consults these flags; it never inspects adapters structurally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub caching: bool,
    pub uploads: bool,
    pub structured_output: bool,
    pub reasoning_effort: bool,
    pub deferred_delivery: bool,
    pub conversation_continuity: bool,
}

impl Capabilities {
    /// Everything enabled.
    pub fn all() -> Self {
        Self {
            caching: true,
            uploads: true,
            structured_output: true,
            reasoning_effort: true,
            deferred_delivery: true,
            conversation_continuity: true,
        }
    }

    pub fn text_only() -> Self {
        Self::default()
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Token usage reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Prompt tokens served from a provider-side cache, if reported.
    #[serde(default)]
    pub cached_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_tokens: None,
        }
    }

    /// Integer counters keyed by name, for key-wise aggregation.
    pub fn counters(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        map.insert("prompt_tokens".to_string(), self.prompt_tokens);
        map.insert("completion_tokens".to_string(), self.completion_tokens);
        map.insert("total_tokens".to_string(), self.total_tokens);
        if let Some(cached) = self.cached_tokens {
            map.insert("cached_tokens".to_string(), cached);
        }
        map
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref().map(|s| s.to_ascii_lowercase()) {
            Some(ref s) if s == "stop" => FinishReason::Stop,
            Some(ref s) if s == "length" || s == "max_tokens" => FinishReason::Length,
            Some(ref s) if s == "content_filter" || s == "safety" => FinishReason::ContentFilter,
            Some(ref s) if s == "tool_calls" => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Result of a single `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    /// Generated text, if the provider returned text.
    pub text: Option<String>,
    /// Structured payload when the call requested structured output.
    pub structured: Option<Value>,
    /// Provider payload as returned, for the provider-structure extractor.
    pub raw: Option<Value>,
    pub usage: Usage,
    pub finish_reason: Option<FinishReason>,
    pub tool_calls: Vec<ToolCall>,
    pub response_id: Option<String>,
    pub latency: Duration,
}

impl GenerateResponse {
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: Some(text.into()),
            structured: None,
            raw: None,
            usage,
            finish_reason: Some(FinishReason::Stop),
            tool_calls: Vec::new(),
            response_id: None,
            latency: Duration::ZERO,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_structured(mut self, structured: Value) -> Self {
        self.structured = Some(structured);
        self
    }

    /// Value handed to the result reducer for this call.
    pub fn raw_output(&self) -> Value {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        match (&self.text, &self.structured) {
            (Some(text), None) => Value::String(text.clone()),
            (text, Some(structured)) => serde_json::json!({
                "text": text,
                "structured": structured,
            }),
            (None, None) => Value::Null,
        }
    }
}
