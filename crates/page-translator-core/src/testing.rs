//! Test doubles shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::config::Lang;
use crate::error::{Error, Result};
use crate::model::{PageNumber, PageReplacement, ProjectPatch, Rotation, Severity};
use crate::scheduler::PatchSink;
use crate::source::{PageInput, PageSource};
use crate::translator::{
    ChunkCallback, FixHint, PageTranslation, Translator, TranslatorInfo, VerificationReport,
};

/// Collects every submitted patch.
#[derive(Default)]
pub struct RecordingSink {
    pub patches: Mutex<Vec<ProjectPatch>>,
    /// When set, every flush fails like a full disk
    pub fail_flush: AtomicBool,
}

impl RecordingSink {
    pub fn translated_pages(&self) -> Vec<PageNumber> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|patch| patch.translations.iter())
            .filter(|(_, slot)| slot.as_set().is_some())
            .map(|(page, _)| *page)
            .collect()
    }
}

#[async_trait]
impl PatchSink for RecordingSink {
    fn submit(&self, patch: ProjectPatch) {
        self.patches.lock().unwrap().push(patch);
    }

    async fn flush(&self) -> Result<()> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(Error::StoreWrite {
                path: PathBuf::from("projects/book-00000000.json"),
                reason: "No space left on device".to_string(),
            });
        }
        Ok(())
    }
}

pub struct TextSource;

#[async_trait]
impl PageSource for TextSource {
    fn page_count(&self) -> u32 {
        10
    }

    async fn page_input(
        &self,
        page: PageNumber,
        _rotation: Rotation,
        _replacement: Option<&PageReplacement>,
    ) -> Result<PageInput> {
        Ok(PageInput::Text(format!("seite {page}")))
    }
}

#[derive(Default)]
pub struct ScriptedTranslator {
    pub gate: Option<Arc<Semaphore>>,
    pub severities: Mutex<VecDeque<Severity>>,
    /// Source texts whose translation fails
    pub failing: Mutex<HashSet<String>>,
    /// Source texts treated as pages without text
    pub blank: Mutex<HashSet<String>>,
    pub hints: Mutex<Vec<Option<FixHint>>>,
    pub translations: AtomicUsize,
}

impl ScriptedTranslator {
    pub fn gated(gate: &Arc<Semaphore>) -> Self {
        Self {
            gate: Some(Arc::clone(gate)),
            ..Self::default()
        }
    }

    pub fn with_severities(severities: &[Severity]) -> Self {
        Self {
            severities: Mutex::new(severities.iter().copied().collect()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    fn info(&self) -> TranslatorInfo {
        TranslatorInfo {
            name: "Scripted",
            model: "scripted-1".to_string(),
            supports_vision: false,
            supports_streaming: true,
        }
    }

    async fn translate(
        &self,
        input: &PageInput,
        _source: &Lang,
        _target: &Lang,
        hint: Option<&FixHint>,
        on_chunk: Option<&ChunkCallback>,
    ) -> Result<PageTranslation> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.translations.fetch_add(1, Ordering::SeqCst);
        self.hints.lock().unwrap().push(hint.cloned());

        let PageInput::Text(text) = input else {
            panic!("text input expected");
        };
        if self.failing.lock().unwrap().contains(text) {
            return Err(Error::TranslationRequest("HTTP 500: boom".to_string()));
        }
        if self.blank.lock().unwrap().contains(text) {
            return Ok(PageTranslation::blank());
        }
        let translated = text.replace("seite", "page");
        if let Some(callback) = on_chunk {
            callback(&translated[..4]);
        }
        let text = if hint.is_some() {
            format!("{translated} (fixed)")
        } else {
            translated
        };
        Ok(PageTranslation {
            text,
            annotations: Vec::new(),
        })
    }

    async fn verify(
        &self,
        _translated: &str,
        _input: &PageInput,
        _source: &Lang,
        _target: &Lang,
    ) -> Result<VerificationReport> {
        let severity = self
            .severities
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Severity::Ok);
        Ok(VerificationReport {
            severity,
            summary: format!("{severity:?}"),
            evidence: vec!["paragraph 2 missing".to_string()],
            annotations: Vec::new(),
        })
    }
}

