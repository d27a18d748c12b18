//! Integration tests for page-translator-core
//!
//! These tests verify the end-to-end workflow:
//! - Project creation, translation and persistence with mock backends
//! - Retrying failed pages and persisting the cleared state
//! - Cancellation never reaching disk
//! - Trash round trips and crash recovery on a real directory

use async_trait::async_trait;
use page_translator_core::model::{
    PageReplacement, Rotation, Severity, Verification, VerificationState,
};
use page_translator_core::store::{ImageKind, RecoveryPolicy};
use page_translator_core::translator::{
    ChunkCallback, FixHint, PageTranslation, TranslatorInfo, VerificationReport,
};
use page_translator_core::{
    AppConfig, EnqueueOptions, Error, Lang, PageInput, PageNumber, PageSource, ProjectPatch,
    ProjectStore, Result, RunOutcome, Session, Translator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// =============================================================================
// Mock collaborators
// =============================================================================

/// Returns predictable translations without network calls.
struct MockTranslator {
    prefix: String,
    /// When set, every translation waits for a permit
    gate: Option<Arc<Semaphore>>,
}

impl MockTranslator {
    fn new() -> Self {
        Self {
            prefix: "[EN]".to_string(),
            gate: None,
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }
}

#[async_trait]
impl Translator for MockTranslator {
    fn info(&self) -> TranslatorInfo {
        TranslatorInfo {
            name: "mock",
            model: "mock-model".to_string(),
            supports_vision: false,
            supports_streaming: false,
        }
    }

    async fn translate(
        &self,
        input: &PageInput,
        _source: &Lang,
        _target: &Lang,
        _hint: Option<&FixHint>,
        _on_chunk: Option<&ChunkCallback>,
    ) -> Result<PageTranslation> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        match input {
            PageInput::Text(text) => Ok(PageTranslation {
                text: format!("{} {}", self.prefix, text),
                annotations: Vec::new(),
            }),
            PageInput::Image { .. } => Err(Error::TranslationRequest(
                "Mock translator has no vision".to_string(),
            )),
        }
    }

    async fn verify(
        &self,
        _translated: &str,
        _input: &PageInput,
        _source: &Lang,
        _target: &Lang,
    ) -> Result<VerificationReport> {
        Ok(VerificationReport {
            severity: Severity::Ok,
            summary: "Faithful".to_string(),
            evidence: Vec::new(),
            annotations: Vec::new(),
        })
    }
}

struct MockSource {
    pages: u32,
}

#[async_trait]
impl PageSource for MockSource {
    fn page_count(&self) -> u32 {
        self.pages
    }

    async fn page_input(
        &self,
        page: PageNumber,
        _rotation: Rotation,
        _replacement: Option<&PageReplacement>,
    ) -> Result<PageInput> {
        Ok(PageInput::Text(format!("Seite {page}")))
    }
}

// =============================================================================
// Test Fixtures
// =============================================================================

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.source_lang = Lang::new("de");
    config.target_lang = Lang::new("en");
    config.orchestration.translate_all_poll_ms = 20;
    config.storage.flush_delay_ms = 50;
    config
}

async fn open_store(pages: u32) -> (tempfile::TempDir, Arc<ProjectStore>, String) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ProjectStore::open(dir.path()).unwrap());
    let doc = store
        .create_or_open("Bericht.pdf", Some("/home/user/Bericht.pdf"), pages)
        .await
        .unwrap();
    (dir, store, doc.file_id)
}

async fn open_session(
    store: &Arc<ProjectStore>,
    file_id: &str,
    translator: MockTranslator,
    pages: u32,
) -> Session {
    Session::open(
        Arc::clone(store),
        file_id,
        Arc::new(translator),
        Arc::new(MockSource { pages }),
        &test_config(),
    )
    .await
    .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_translate_all_persists_every_page() {
    let (_dir, store, id) = open_store(4).await;
    let session = open_session(&store, &id, MockTranslator::new(), 4).await;

    let run = session.orchestrator.translate_all().unwrap();
    assert_eq!(
        run.wait().await,
        RunOutcome::Completed {
            translated: 4,
            failed: 0
        }
    );
    // Verifications follow translations
    while !session.scheduler().is_idle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.close().await.unwrap();

    let doc = store.load(&id).await.unwrap();
    assert_eq!(doc.translated_count(), 4);
    assert_eq!(doc.translations[&3], "[EN] Seite 3");
    assert_eq!(doc.translations_meta[&3].model, "mock-model");
    for page in 1..=4 {
        assert_eq!(doc.verifications[&page].severity, Some(Severity::Ok));
    }
    assert!(doc.updated_at.is_some());
}

#[tokio::test]
async fn test_retry_all_errors_clears_pages_two_and_three() {
    let (_dir, store, id) = open_store(3).await;
    let mut patch = ProjectPatch::new();
    for page in 1..=3 {
        patch.translations.insert(page, page_translator_core::Slot::Set(format!("old {page}")));
    }
    patch = patch
        .verification(
            2,
            Verification {
                state: VerificationState::Verified,
                severity: Some(Severity::Severe),
                ..Verification::default()
            },
        )
        .verification(
            3,
            Verification {
                state: VerificationState::Failed,
                summary: Some("HTTP 500".to_string()),
                ..Verification::default()
            },
        );
    store.save_patch(&id, &patch).await.unwrap();

    let session = open_session(&store, &id, MockTranslator::new(), 3).await;
    session.scheduler().pause();

    let retried = session.orchestrator.retry_all_errors().await.unwrap();
    assert_eq!(retried, vec![2, 3]);

    // The cleared state reached disk before anything was re-queued
    let on_disk = store.load(&id).await.unwrap();
    assert_eq!(on_disk.translations.get(&1).map(String::as_str), Some("old 1"));
    assert!(!on_disk.translations.contains_key(&2));
    assert!(!on_disk.translations.contains_key(&3));
    assert!(on_disk.verifications.is_empty());
    assert!(session.scheduler().page_status(2).loading);
    assert!(session.scheduler().page_status(3).loading);

    session.scheduler().resume();
    while !session.scheduler().is_idle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    session.close().await.unwrap();

    let doc = store.load(&id).await.unwrap();
    assert_eq!(doc.translations[&1], "old 1");
    assert_eq!(doc.translations[&2], "[EN] Seite 2");
    assert_eq!(doc.translations[&3], "[EN] Seite 3");
}

#[tokio::test]
async fn test_stopped_page_never_reaches_disk() {
    let (_dir, store, id) = open_store(2).await;
    let gate = Arc::new(Semaphore::new(0));
    let session = open_session(&store, &id, MockTranslator::gated(Arc::clone(&gate)), 2).await;

    session
        .scheduler()
        .enqueue(1, EnqueueOptions::front())
        .unwrap();
    assert!(session.scheduler().stop(1));
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close().await.unwrap();

    let doc = store.load(&id).await.unwrap();
    assert!(doc.translations.is_empty());
}

#[tokio::test]
async fn test_trash_round_trip_with_assets() {
    let (_dir, store, id) = open_store(2).await;
    let patch = store
        .store_page_image(&id, 1, ImageKind::Source, b"\x89PNG fake", "png")
        .await
        .unwrap();
    store.save_patch(&id, &patch).await.unwrap();

    let doc_bytes = std::fs::read(store.document_path(&id)).unwrap();
    let asset = store.assets_dir(&id).join("sources/page-0001.png");
    assert!(asset.is_file());

    let trash_id = store.trash().delete(&id).await.unwrap();
    assert!(!store.exists(&id));
    assert!(!asset.exists());
    assert!(store.list_projects().await.unwrap().is_empty());

    let entries = store.trash().list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].file_id, id);

    assert_eq!(store.trash().restore(&trash_id).await.unwrap(), id);
    assert_eq!(std::fs::read(store.document_path(&id)).unwrap(), doc_bytes);
    assert_eq!(std::fs::read(&asset).unwrap(), b"\x89PNG fake");
    assert!(store.trash().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_recovery_promotes_newer_interrupted_write() {
    let (_dir, store, id) = open_store(5).await;
    let target = store.document_path(&id);

    let mut newer = store.load(&id).await.unwrap();
    newer.translations.insert(1, "recovered".to_string());
    let temp = target.with_file_name(format!("{id}.json.0123456789ab.tmp"));
    std::fs::write(&temp, serde_json::to_vec(&newer).unwrap()).unwrap();

    let now = filetime::FileTime::now();
    let earlier = filetime::FileTime::from_unix_time(now.unix_seconds() - 60, 0);
    filetime::set_file_mtime(&target, earlier).unwrap();
    filetime::set_file_mtime(&temp, now).unwrap();

    let report = store.recover(RecoveryPolicy::default()).await.unwrap();
    assert_eq!(report.promoted, vec![target.clone()]);
    assert!(!temp.exists());
    assert_eq!(store.load(&id).await.unwrap().translations[&1], "recovered");
}
