//! Rules deciding which pages get translated and when.
//!
//! The orchestrator sits between user actions and the [`Scheduler`]: reading
//! position changes become debounced prefetch requests, "translate all"
//! becomes a run of back-priority jobs watched until it settles, and user
//! edits (rotations, overlays, replacements) become document patches.

mod prefetch;

pub use prefetch::{LayoutMode, PrefetchPlan, prefetch_plan, wrap_around_order};

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestrationConfig;
use crate::error::{Error, Result};
use crate::model::{
    PageDims, PageNumber, PageReplacement, ProjectDocument, ProjectPatch, Rotation, Slot,
    UserHighlight, UserNote,
};
use crate::scheduler::{EnqueueOptions, Enqueued, PageStatus, Scheduler};

/// How a translate-all run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left running; counts cover the run's pages
    Completed { translated: usize, failed: usize },
    /// A newer run started, or the run was stopped
    Superseded,
    /// The scheduler was paused
    Paused,
}

/// A started translate-all run.
pub struct TranslateAll {
    pub run_id: String,
    /// Pages requested by this run, in request order
    pub pages: Vec<PageNumber>,
    watcher: JoinHandle<RunOutcome>,
}

impl TranslateAll {
    /// Wait for the run's watcher to finish.
    pub async fn wait(self) -> RunOutcome {
        self.watcher.await.unwrap_or_else(|e| {
            debug!("Watcher for run {} ended early: {}", self.run_id, e);
            RunOutcome::Superseded
        })
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    scheduler: Scheduler,
    config: OrchestrationConfig,
    /// Bumped on every navigation; a pending prefetch only fires if unchanged
    navigation: Arc<AtomicU64>,
    current_run: Arc<Mutex<Option<String>>>,
}

impl Orchestrator {
    pub fn new(scheduler: Scheduler, config: OrchestrationConfig) -> Self {
        Self {
            scheduler,
            config,
            navigation: Arc::new(AtomicU64::new(0)),
            current_run: Arc::new(Mutex::new(None)),
        }
    }

    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // =========================================================================
    // Reading position
    // =========================================================================

    /// Record the reading position and schedule a debounced prefetch.
    pub fn on_navigate(&self, page: PageNumber, layout: LayoutMode) -> Result<()> {
        self.scheduler.check_page(page)?;
        self.scheduler.update(ProjectPatch::new().last_page(page));

        let generation = self.navigation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.prefetch_debounce()).await;
            if this.navigation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = this.prefetch(page, layout) {
                warn!("Prefetch around page {} failed: {}", page, e);
            }
        });
        Ok(())
    }

    /// Request the visible pages and the pages just ahead of them.
    pub fn prefetch(&self, page: PageNumber, layout: LayoutMode) -> Result<PrefetchPlan> {
        let statuses = self.scheduler.page_statuses();
        let plan = self.scheduler.with_document(|doc| {
            prefetch_plan(
                page,
                layout,
                self.config.prefetch_ahead,
                doc.total_pages,
                |p| is_settled(doc, &statuses, p),
            )
        });

        for &p in &plan.front {
            self.scheduler.enqueue(p, EnqueueOptions::front())?;
        }
        for &p in &plan.back {
            self.scheduler.enqueue(p, EnqueueOptions::back())?;
        }
        if !plan.is_empty() {
            debug!("Prefetch around page {}: {:?}", page, plan);
        }
        Ok(plan)
    }

    // =========================================================================
    // Bulk actions
    // =========================================================================

    /// Queue every untranslated, non-failed page, starting at the reading
    /// position and wrapping around, and watch the run until it settles.
    pub fn translate_all(&self) -> Result<TranslateAll> {
        let run_id = Uuid::new_v4().to_string();
        *self.lock_run() = Some(run_id.clone());

        let statuses = self.scheduler.page_statuses();
        let pages: Vec<PageNumber> = self.scheduler.with_document(|doc| {
            wrap_around_order(doc.last_page, doc.total_pages)
                .into_iter()
                .filter(|&p| !is_settled(doc, &statuses, p))
                .collect()
        });

        for &page in &pages {
            self.scheduler.enqueue(page, EnqueueOptions::back())?;
        }
        info!("Translate-all run {} queued {} pages", run_id, pages.len());

        let watcher = tokio::spawn(self.clone().watch_run(run_id.clone(), pages.clone()));
        Ok(TranslateAll {
            run_id,
            pages,
            watcher,
        })
    }

    /// End the current translate-all run and cancel all pending work.
    pub fn stop_all(&self) -> usize {
        *self.lock_run() = None;
        self.scheduler.abort_all()
    }

    /// Clear every failed or severely flagged page, persist the cleared
    /// state, then translate those pages again at front priority.
    pub async fn retry_all_errors(&self) -> Result<Vec<PageNumber>> {
        let pages = self.scheduler.pages_needing_retry();
        if pages.is_empty() {
            return Ok(pages);
        }

        self.scheduler.reset_pages(&pages);
        let persisted = self.scheduler.persist().await;
        if let Err(e) = &persisted {
            // Cleared pages are no longer marked failed; queue them anyway.
            warn!("Cleared state of {} pages not saved yet: {}", pages.len(), e);
        }

        for &page in &pages {
            self.scheduler.enqueue(page, EnqueueOptions::front().forced())?;
        }
        info!("Retrying {} pages", pages.len());
        persisted.map(|()| pages)
    }

    /// Corrective re-translation guided by the page's verification.
    pub fn fix_page(&self, page: PageNumber) -> Result<Enqueued> {
        self.scheduler.fix_page(page)
    }

    async fn watch_run(self, run_id: String, pages: Vec<PageNumber>) -> RunOutcome {
        let poll = self.config.translate_all_poll();
        loop {
            tokio::time::sleep(poll).await;

            if self.lock_run().as_deref() != Some(run_id.as_str()) {
                debug!("Run {} superseded", run_id);
                return RunOutcome::Superseded;
            }
            if self.scheduler.is_paused() {
                debug!("Run {} stopped watching: scheduler paused", run_id);
                return RunOutcome::Paused;
            }
            if self.scheduler.is_idle() {
                let statuses = self.scheduler.page_statuses();
                let translated = self.scheduler.with_document(|doc| {
                    pages.iter().filter(|&&p| doc.is_translated(p)).count()
                });
                let failed = pages
                    .iter()
                    .filter(|p| statuses.get(p).is_some_and(|s| s.error.is_some()))
                    .count();
                info!(
                    "Run {} completed: {} translated, {} failed",
                    run_id, translated, failed
                );
                return RunOutcome::Completed { translated, failed };
            }
        }
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.current_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Page edits
    // =========================================================================

    pub fn set_rotation(&self, page: PageNumber, degrees: i64) -> Result<Rotation> {
        self.scheduler.check_page(page)?;
        let rotation = Rotation::try_from(degrees)?;
        self.scheduler
            .update(ProjectPatch::new().rotation(page, rotation));
        Ok(rotation)
    }

    /// Render `page` from another document's page, or from its own when `None`.
    pub fn set_page_replacement(
        &self,
        page: PageNumber,
        replacement: Option<(String, PageNumber)>,
    ) -> Result<()> {
        self.scheduler.check_page(page)?;
        let slot = match replacement {
            Some((source_file_path, source_page_number)) => Slot::Set(PageReplacement {
                source_file_path,
                source_page_number,
                updated_at: Utc::now(),
            }),
            None => Slot::Remove,
        };
        let mut patch = ProjectPatch::new();
        patch.page_replacements.insert(page, slot);
        self.scheduler.update(patch);
        Ok(())
    }

    pub fn record_page_dims(&self, page: PageNumber, width: f32, height: f32) -> Result<()> {
        self.scheduler.check_page(page)?;
        let mut patch = ProjectPatch::new();
        patch
            .page_dims
            .insert(page, Slot::Set(PageDims { width, height }));
        self.scheduler.update(patch);
        Ok(())
    }

    pub fn add_highlight(
        &self,
        page: PageNumber,
        start: usize,
        end: usize,
        color: Option<String>,
    ) -> Result<UserHighlight> {
        self.scheduler.check_page(page)?;
        check_range(start, end)?;
        let highlight = UserHighlight {
            id: Uuid::new_v4().to_string(),
            start,
            end,
            color,
            created_at: Utc::now(),
        };

        self.scheduler.update_with(|doc| {
            let mut list = doc.user_highlights.get(&page).cloned().unwrap_or_default();
            list.push(highlight.clone());
            let mut patch = ProjectPatch::new();
            patch.user_highlights.insert(page, Slot::Set(list));
            (patch, ())
        });
        Ok(highlight)
    }

    /// Returns whether a highlight with `id` existed.
    pub fn remove_highlight(&self, page: PageNumber, id: &str) -> bool {
        self.scheduler.update_with(|doc| {
            let mut patch = ProjectPatch::new();
            let Some(mut list) = doc.user_highlights.get(&page).cloned() else {
                return (patch, false);
            };
            let before = list.len();
            list.retain(|h| h.id != id);
            if list.len() == before {
                return (patch, false);
            }
            patch.user_highlights.insert(page, list_slot(list));
            (patch, true)
        })
    }

    pub fn add_note(
        &self,
        page: PageNumber,
        start: usize,
        end: usize,
        text: impl Into<String>,
    ) -> Result<UserNote> {
        self.scheduler.check_page(page)?;
        check_range(start, end)?;
        let note = UserNote {
            id: Uuid::new_v4().to_string(),
            start,
            end,
            text: text.into(),
            created_at: Utc::now(),
        };

        self.scheduler.update_with(|doc| {
            let mut list = doc.user_notes.get(&page).cloned().unwrap_or_default();
            list.push(note.clone());
            let mut patch = ProjectPatch::new();
            patch.user_notes.insert(page, Slot::Set(list));
            (patch, ())
        });
        Ok(note)
    }

    pub fn remove_note(&self, page: PageNumber, id: &str) -> bool {
        self.scheduler.update_with(|doc| {
            let mut patch = ProjectPatch::new();
            let Some(mut list) = doc.user_notes.get(&page).cloned() else {
                return (patch, false);
            };
            let before = list.len();
            list.retain(|n| n.id != id);
            if list.len() == before {
                return (patch, false);
            }
            patch.user_notes.insert(page, list_slot(list));
            (patch, true)
        })
    }
}

fn is_settled(
    doc: &ProjectDocument,
    statuses: &BTreeMap<PageNumber, PageStatus>,
    page: PageNumber,
) -> bool {
    doc.is_translated(page) || statuses.get(&page).is_some_and(|s| s.error.is_some())
}

const fn check_range(start: usize, end: usize) -> Result<()> {
    if start >= end {
        return Err(Error::InvalidRange { start, end });
    }
    Ok(())
}

/// An emptied overlay list removes the page key.
fn list_slot<T>(list: Vec<T>) -> Slot<Vec<T>> {
    if list.is_empty() {
        Slot::Remove
    } else {
        Slot::Set(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::model::{Severity, Verification, VerificationState};
    use crate::scheduler::PatchSink;
    use crate::testing::{RecordingSink, ScriptedTranslator, TextSource};
    use std::time::Duration;

    fn orchestrator(
        document: ProjectDocument,
        translator: Arc<ScriptedTranslator>,
    ) -> (Orchestrator, Arc<RecordingSink>) {
        let mut config = AppConfig::default();
        config.scheduler.verify_after_translate = false;
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            document,
            translator,
            Arc::new(TextSource),
            Arc::clone(&sink) as Arc<dyn PatchSink>,
            &config,
        );
        (Orchestrator::new(scheduler, config.orchestration), sink)
    }

    fn document(total: u32) -> ProjectDocument {
        ProjectDocument::new("book-00000000", "book.pdf", None, total)
    }

    #[tokio::test]
    async fn test_prefetch_requests_visible_then_ahead() {
        let mut doc = document(10);
        doc.translations.insert(5, "done".to_string());
        let (orch, _sink) = orchestrator(doc, Arc::new(ScriptedTranslator::default()));
        orch.scheduler().pause();

        let plan = orch.prefetch(3, LayoutMode::Spread).unwrap();
        assert_eq!(plan.front, vec![3, 4]);
        assert_eq!(plan.back, vec![6]);
        assert_eq!(orch.scheduler().queue_stats().queued, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_is_debounced() {
        let (orch, _sink) = orchestrator(document(20), Arc::new(ScriptedTranslator::default()));
        orch.scheduler().pause();

        orch.on_navigate(2, LayoutMode::Single).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        orch.on_navigate(8, LayoutMode::Single).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        // Only the last position produced requests
        let statuses = orch.scheduler().page_statuses();
        assert!(!statuses.contains_key(&2));
        assert!(statuses[&8].loading);
        assert_eq!(orch.scheduler().queue_stats().queued, 3);
        assert_eq!(orch.scheduler().snapshot().last_page, 8);
    }

    #[tokio::test]
    async fn test_translate_all_wraps_from_reading_position() {
        let mut doc = document(5);
        doc.last_page = 3;
        doc.translations.insert(4, "done".to_string());
        let (orch, _sink) = orchestrator(doc, Arc::new(ScriptedTranslator::default()));

        let run = orch.translate_all().unwrap();
        assert_eq!(run.pages, vec![3, 5, 1, 2]);
        assert_eq!(
            run.wait().await,
            RunOutcome::Completed {
                translated: 4,
                failed: 0
            }
        );
        assert_eq!(orch.scheduler().snapshot().translated_count(), 5);
    }

    #[tokio::test]
    async fn test_newer_run_supersedes_older_watcher() {
        let (orch, _sink) = orchestrator(document(3), Arc::new(ScriptedTranslator::default()));
        orch.scheduler().pause();

        let first = orch.translate_all().unwrap();
        let second = orch.translate_all().unwrap();
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.wait().await, RunOutcome::Superseded);
        assert_eq!(second.wait().await, RunOutcome::Paused);
    }

    #[tokio::test]
    async fn test_retry_all_errors_clears_and_front_queues() {
        let mut doc = document(3);
        for page in 1..=3 {
            doc.translations.insert(page, format!("page {page}"));
        }
        doc.verifications.insert(
            2,
            Verification {
                state: VerificationState::Verified,
                severity: Some(Severity::Severe),
                ..Verification::default()
            },
        );
        doc.verifications.insert(
            3,
            Verification {
                state: VerificationState::Failed,
                ..Verification::default()
            },
        );
        let (orch, sink) = orchestrator(doc, Arc::new(ScriptedTranslator::default()));
        orch.scheduler().pause();

        let pages = orch.retry_all_errors().await.unwrap();
        assert_eq!(pages, vec![2, 3]);

        let snapshot = orch.scheduler().snapshot();
        assert!(snapshot.is_translated(1));
        assert!(!snapshot.is_translated(2));
        assert!(!snapshot.verifications.contains_key(&3));
        assert!(orch.scheduler().page_status(2).loading);
        assert!(orch.scheduler().page_status(3).loading);
        assert!(!orch.scheduler().page_status(1).loading);

        let cleared = sink.patches.lock().unwrap()[0].clone();
        assert_eq!(cleared.translations.get(&2), Some(&Slot::Remove));
        assert!(!cleared.translations.contains_key(&1));
    }

    #[tokio::test]
    async fn test_retry_all_errors_resets_failed_translation() {
        let mut doc = document(3);
        doc.translations.insert(1, "page 1".to_string());
        doc.translations.insert(3, "page 3".to_string());
        doc.verifications.insert(
            3,
            Verification {
                state: VerificationState::Verified,
                severity: Some(Severity::Severe),
                ..Verification::default()
            },
        );
        let translator = Arc::new(ScriptedTranslator::default());
        translator.failing.lock().unwrap().insert("seite 2".to_string());
        let (orch, _sink) = orchestrator(doc, Arc::clone(&translator));

        orch.scheduler().enqueue(2, EnqueueOptions::front()).unwrap();
        while !orch.scheduler().is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(orch.scheduler().page_status(2).error.is_some());

        translator.failing.lock().unwrap().clear();
        orch.scheduler().pause();
        let pages = orch.retry_all_errors().await.unwrap();
        assert_eq!(pages, vec![2, 3]);

        let status = orch.scheduler().page_status(2);
        assert!(status.error.is_none());
        assert!(status.loading);
        assert!(orch.scheduler().page_status(3).loading);
        assert!(!orch.scheduler().page_status(1).loading);
        assert_eq!(orch.scheduler().snapshot().translations[&1], "page 1");

        orch.scheduler().resume();
        while !orch.scheduler().is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snapshot = orch.scheduler().snapshot();
        assert_eq!(snapshot.translations[&2], "page 2");
        assert!(orch.scheduler().pages_needing_retry().is_empty());
    }

    #[tokio::test]
    async fn test_retry_all_errors_queues_pages_when_save_fails() {
        let mut doc = document(2);
        doc.translations.insert(2, "page 2".to_string());
        doc.verifications.insert(
            2,
            Verification {
                state: VerificationState::Failed,
                ..Verification::default()
            },
        );
        let (orch, sink) = orchestrator(doc, Arc::new(ScriptedTranslator::default()));
        sink.fail_flush.store(true, std::sync::atomic::Ordering::SeqCst);
        orch.scheduler().pause();

        let result = orch.retry_all_errors().await;
        assert!(matches!(result, Err(Error::StoreWrite { .. })));
        assert!(orch.scheduler().page_status(2).loading);

        orch.scheduler().resume();
        while !orch.scheduler().is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orch.scheduler().snapshot().translations[&2], "page 2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overlay_edits_are_all_kept() {
        let (orch, _sink) = orchestrator(document(1), Arc::new(ScriptedTranslator::default()));

        let mut handles = Vec::new();
        for i in 0..32 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                orch.add_highlight(1, i, i + 1, None).unwrap();
                orch.add_note(1, i, i + 2, format!("note {i}")).unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = orch.scheduler().snapshot();
        assert_eq!(doc.user_highlights[&1].len(), 32);
        assert_eq!(doc.user_notes[&1].len(), 32);
    }

    #[tokio::test]
    async fn test_page_edits() {
        let (orch, _sink) = orchestrator(document(4), Arc::new(ScriptedTranslator::default()));

        assert_eq!(orch.set_rotation(2, 270).unwrap(), Rotation::Deg270);
        assert!(matches!(orch.set_rotation(2, 45), Err(Error::InvalidRotation(45))));
        assert!(orch.set_rotation(9, 90).is_err());

        orch.set_page_replacement(1, Some(("scan.pdf".to_string(), 7))).unwrap();
        orch.record_page_dims(1, 612.0, 792.0).unwrap();

        let highlight = orch.add_highlight(1, 0, 5, None).unwrap();
        let note = orch.add_note(1, 2, 9, "check this").unwrap();
        assert!(orch.add_note(1, 9, 2, "reversed").is_err());

        let doc = orch.scheduler().snapshot();
        assert_eq!(doc.rotation(2), Rotation::Deg270);
        assert_eq!(doc.page_replacements[&1].source_page_number, 7);
        assert_eq!(doc.user_highlights[&1].len(), 1);
        assert_eq!(doc.user_notes[&1][0].text, "check this");

        assert!(orch.remove_highlight(1, &highlight.id));
        assert!(!orch.remove_highlight(1, &highlight.id));
        assert!(orch.remove_note(1, &note.id));
        orch.set_page_replacement(1, None).unwrap();

        let doc = orch.scheduler().snapshot();
        assert!(doc.user_highlights.is_empty());
        assert!(doc.user_notes.is_empty());
        assert!(doc.page_replacements.is_empty());
    }
}
