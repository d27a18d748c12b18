use async_trait::async_trait;
use crate::config::Lang;
use crate::error::Result;
use crate::model::{Annotation, BLANK_PAGE_MARKER, Severity};
use crate::source::PageInput;

/// Information about a translator backend
#[derive(Debug, Clone)]
pub struct TranslatorInfo {
    /// Human-readable name
    pub name: &'static str,
    /// Model identifier recorded in translation and verification metadata
    pub model: String,
    /// Whether page images can be sent as input
    pub supports_vision: bool,
    /// Whether partial text is delivered while a request runs
    pub supports_streaming: bool,
}

/// Receives the translation text streamed so far, annotation block excluded.
pub type ChunkCallback = dyn Fn(&str) + Send + Sync;

/// A finished page translation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTranslation {
    pub text: String,
    pub annotations: Vec<Annotation>,
}

impl PageTranslation {
    /// Translation of a page without any text.
    pub fn blank() -> Self {
        Self {
            text: BLANK_PAGE_MARKER.to_string(),
            annotations: Vec::new(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text == BLANK_PAGE_MARKER
    }
}

/// Verification verdict for a translated page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub severity: Severity,
    pub summary: String,
    pub evidence: Vec<String>,
    pub annotations: Vec<Annotation>,
}

/// Guidance attached to a corrective re-translation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixHint {
    pub summary: Option<String>,
    pub evidence: Vec<String>,
    pub previous_translation: Option<String>,
}

/// Trait for AI translation backends
#[async_trait]
pub trait Translator: Send + Sync {
    /// Get information about this translator
    fn info(&self) -> TranslatorInfo;

    /// Get the translator name (convenience method)
    fn name(&self) -> &'static str {
        self.info().name
    }

    /// Translate one page.
    ///
    /// `hint` carries verification evidence on a corrective pass.
    /// Implementations that stream call `on_chunk` whenever the visible text grows.
    async fn translate(
        &self,
        input: &PageInput,
        source: &Lang,
        target: &Lang,
        hint: Option<&FixHint>,
        on_chunk: Option<&ChunkCallback>,
    ) -> Result<PageTranslation>;

    /// Check a translation against its source page.
    async fn verify(
        &self,
        translated: &str,
        input: &PageInput,
        source: &Lang,
        target: &Lang,
    ) -> Result<VerificationReport>;

    /// Check if the translator is available (e.g., API key configured)
    fn is_available(&self) -> bool {
        true
    }
}
