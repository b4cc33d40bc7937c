//! Input content references.
//!
//! A [`Source`] is immutable once built. Its bytes are loaded lazily and its
//! content hash is derived on demand for cache identity. Remote kinds
//! (URIs, YouTube, arXiv) hash their canonical reference rather than
//! downloading anything.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::PipelineError;
use crate::gateway::Part;

/// What a source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Text,
    File,
    Uri,
    Youtube,
    Arxiv,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Text => "text",
            SourceKind::File => "file",
            SourceKind::Uri => "uri",
            SourceKind::Youtube => "youtube",
            SourceKind::Arxiv => "arxiv",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceKind::Uri | SourceKind::Youtube | SourceKind::Arxiv)
    }
}

/// Lazily produces a source's bytes.
pub type ContentLoader =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>, PipelineError>> + Send + Sync>;

/// An input content reference.
#[derive(Clone)]
pub struct Source {
    pub kind: SourceKind,
    /// Path, URL, or a short label for inline text.
    pub identifier: String,
    pub mime_type: String,
    pub size_bytes: u64,
    loader: ContentLoader,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("kind", &self.kind)
            .field("identifier", &self.identifier)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

static YOUTUBE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(www\.|m\.)?(youtube\.com/(watch\?v=|shorts/|embed/)|youtu\.be/)[\w-]{6,}")
        .expect("valid youtube regex")
});

static ARXIV_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}\.\d{4,5}(v\d+)?|[a-z-]+(\.[A-Z]{2})?/\d{7}(v\d+)?)$")
        .expect("valid arxiv id regex")
});

static ARXIV_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(www\.|export\.)?arxiv\.org/(abs|pdf)/(?P<id>.+?)(\.pdf)?/?$")
        .expect("valid arxiv url regex")
});

/// Loader over bytes already in memory.
pub fn bytes_loader(bytes: Vec<u8>) -> ContentLoader {
    let bytes = Arc::new(bytes);
    Arc::new(move || {
        let bytes = bytes.clone();
        async move { Ok(bytes.as_ref().clone()) }.boxed()
    })
}

/// Canonical PDF URL for an arXiv identifier or abstract/PDF URL.
pub fn canonical_arxiv_pdf(reference: &str) -> Option<String> {
    let reference = reference.trim();
    let id = match ARXIV_URL_RE.captures(reference) {
        Some(caps) => caps.name("id")?.as_str().to_string(),
        None => reference.strip_prefix("arXiv:").unwrap_or(reference).to_string(),
    };
    ARXIV_ID_RE
        .is_match(&id)
        .then(|| format!("https://arxiv.org/pdf/{id}"))
}

impl Source {
    /// Inline text.
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        let size_bytes = content.len() as u64;
        let label: String = content.chars().take(32).collect();
        Self {
            kind: SourceKind::Text,
            identifier: label,
            mime_type: "text/plain".to_string(),
            size_bytes,
            loader: bytes_loader(content.into_bytes()),
        }
    }

    /// Local file. MIME type is guessed from the extension.
    pub fn file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            PipelineError::source(format!("cannot read {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(PipelineError::source(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let load_path = path.clone();
        let loader: ContentLoader = Arc::new(move || {
            let path = load_path.clone();
            async move {
                tokio::fs::read(&path).await.map_err(|e| {
                    PipelineError::source(format!("cannot read {}: {e}", path.display()))
                })
            }
            .boxed()
        });

        Ok(Self {
            kind: SourceKind::File,
            identifier: path.display().to_string(),
            mime_type,
            size_bytes: metadata.len(),
            loader,
        })
    }

    /// Remote URI the provider (or the materialization stage) can fetch.
    pub fn uri(uri: impl Into<String>, mime_type: Option<&str>) -> Result<Self, PipelineError> {
        let uri = uri.into();
        let parsed = reqwest::Url::parse(&uri)
            .map_err(|e| PipelineError::source(format!("invalid uri {uri}: {e}")))?;
        let mime_type = match mime_type {
            Some(m) => m.to_string(),
            None => mime_guess::from_path(parsed.path())
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };
        Ok(Self::remote(SourceKind::Uri, parsed.to_string(), mime_type))
    }

    pub fn youtube(url: impl Into<String>) -> Result<Self, PipelineError> {
        let url = url.into();
        if !YOUTUBE_RE.is_match(&url) {
            return Err(PipelineError::source(format!("not a YouTube url: {url}")));
        }
        Ok(Self::remote(SourceKind::Youtube, url, "video/mp4".to_string()))
    }

    /// arXiv paper by id (`2401.01234`) or by abstract/PDF URL.
    pub fn arxiv(reference: &str) -> Result<Self, PipelineError> {
        let pdf = canonical_arxiv_pdf(reference)
            .ok_or_else(|| PipelineError::source(format!("not an arXiv reference: {reference}")))?;
        Ok(Self::remote(SourceKind::Arxiv, pdf, "application/pdf".to_string()))
    }

    fn remote(kind: SourceKind, reference: String, mime_type: String) -> Self {
        Self {
            kind,
            loader: bytes_loader(reference.clone().into_bytes()),
            identifier: reference,
            mime_type,
            size_bytes: 0,
        }
    }

    /// Source with a caller-supplied loader.
    pub fn with_loader(
        kind: SourceKind,
        identifier: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
        loader: ContentLoader,
    ) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            mime_type: mime_type.into(),
            size_bytes,
            loader,
        }
    }

    /// Load the source's bytes.
    pub async fn load(&self) -> Result<Vec<u8>, PipelineError> {
        (self.loader)().await
    }

    /// blake3 hash of the content (the canonical reference for remote kinds).
    pub async fn content_hash(&self) -> Result<String, PipelineError> {
        let bytes = self.load().await?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn is_text(&self) -> bool {
        self.kind == SourceKind::Text || self.mime_type.starts_with("text/")
    }

    /// Content part sent to the provider for this source.
    ///
    /// Text is inlined; local files stay pending until upload; remote kinds
    /// become URI parts.
    pub async fn to_part(&self) -> Result<Part, PipelineError> {
        match self.kind {
            SourceKind::Text => {
                let bytes = self.load().await?;
                Ok(Part::text(String::from_utf8_lossy(&bytes).into_owned()))
            }
            SourceKind::File => Ok(Part::file(
                PathBuf::from(&self.identifier),
                self.mime_type.clone(),
            )),
            SourceKind::Uri | SourceKind::Youtube | SourceKind::Arxiv => {
                Ok(Part::uri(self.identifier.clone(), self.mime_type.clone()))
            }
        }
    }
}
