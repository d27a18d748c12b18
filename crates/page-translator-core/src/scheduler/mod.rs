//! Per-project page job scheduler.
//!
//! The scheduler owns the in-memory [`ProjectDocument`] of one project and a
//! two-tier queue of page jobs. Up to `concurrency` jobs run at once, each as
//! a spawned task carrying a [`CancellationToken`]. Results are folded into
//! the document and forwarded to a [`PatchSink`] as partial updates.
//!
//! State lives behind a synchronous mutex that is never held across an
//! `.await`: tasks snapshot what they need, release the lock, call the page
//! source and the translator, then re-acquire the lock to commit. A commit
//! only happens while the job is still the page's active job, so nothing is
//! written for a page after [`Scheduler::stop`] returns.

mod job;
mod queue;

pub use job::{
    EnqueueOptions, Enqueued, Job, JobKind, PageStatus, Priority, QueueStats, SchedulerEvent, Task,
};
pub use queue::JobQueue;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, Lang, SchedulerConfig};
use crate::error::{Error, Result};
use crate::model::{
    ContentMeta, PageNumber, PageReplacement, ProjectDocument, ProjectPatch, Rotation, Severity,
    Slot, Verification, VerificationState,
};
use crate::source::PageSource;
use crate::store::merge_project_data;
use crate::translator::{ChunkCallback, FixHint, PageTranslation, Translator, VerificationReport};

const EVENT_CAPACITY: usize = 256;

/// Destination for partial project updates produced by the scheduler.
#[async_trait]
pub trait PatchSink: Send + Sync {
    /// Queue a patch for persistence. Must not block.
    fn submit(&self, patch: ProjectPatch);

    /// Persist everything submitted so far.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct ActiveJob {
    id: u64,
    kind: JobKind,
    token: CancellationToken,
}

struct State {
    document: ProjectDocument,
    queue: JobQueue,
    active: HashMap<PageNumber, ActiveJob>,
    errors: BTreeMap<PageNumber, String>,
    partial: BTreeMap<PageNumber, String>,
    paused: bool,
    next_id: u64,
}

/// Everything a job task needs, captured at dispatch time.
struct Dispatch {
    job: Job,
    id: u64,
    token: CancellationToken,
    rotation: Rotation,
    replacement: Option<PageReplacement>,
    /// Current translation: reviewed by a verify job, replaced by a fix job
    translation: Option<String>,
    run_id: Option<String>,
}

enum Outcome {
    Translated {
        translation: PageTranslation,
        previous: Option<String>,
        fix: bool,
    },
    TranslateFailed(Error),
    Verified {
        report: VerificationReport,
        after_fix: bool,
        changed: Option<bool>,
        run_id: Option<String>,
    },
    VerifyFailed {
        error: Error,
        run_id: Option<String>,
    },
}

struct Inner {
    translator: Arc<dyn Translator>,
    source: Arc<dyn PageSource>,
    sink: Arc<dyn PatchSink>,
    config: SchedulerConfig,
    source_lang: Lang,
    target_lang: Lang,
    state: Mutex<State>,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Handle to a project's scheduler. Clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler seeded with a loaded project document.
    ///
    /// Verifications left in the `verifying` state by an interrupted run are
    /// marked failed so they show up for retry.
    pub fn new(
        document: ProjectDocument,
        translator: Arc<dyn Translator>,
        source: Arc<dyn PageSource>,
        sink: Arc<dyn PatchSink>,
        config: &AppConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            translator,
            source,
            sink,
            config: config.scheduler.clone(),
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            state: Mutex::new(State {
                document,
                queue: JobQueue::new(),
                active: HashMap::new(),
                errors: BTreeMap::new(),
                partial: BTreeMap::new(),
                paused: false,
                next_id: 0,
            }),
            events,
        });

        {
            let mut state = inner.lock();
            let mut patch = ProjectPatch::new();
            for (page, verification) in &state.document.verifications {
                if verification.state == VerificationState::Verifying {
                    let mut interrupted = verification.clone();
                    interrupted.state = VerificationState::Failed;
                    interrupted.summary = Some("Verification was interrupted".to_string());
                    patch.verifications.insert(*page, Slot::Set(interrupted));
                }
            }
            if !patch.is_empty() {
                debug!("Marking {} interrupted verifications as failed", patch.verifications.len());
                inner.apply(&mut state, patch);
            }
        }

        Self { inner }
    }

    pub fn file_id(&self) -> String {
        self.inner.lock().document.file_id.clone()
    }

    pub fn total_pages(&self) -> u32 {
        self.inner.lock().document.total_pages
    }

    /// Fail unless `page` lies within the document.
    pub fn check_page(&self, page: PageNumber) -> Result<()> {
        check_page(&self.inner.lock().document, page)
    }

    /// Request a translation of `page`.
    pub fn enqueue(&self, page: PageNumber, options: EnqueueOptions) -> Result<Enqueued> {
        self.submit_job(Job::translate(page), options)
    }

    /// Clear the page's error and translate it again ahead of everything else.
    pub fn retranslate_page(&self, page: PageNumber) -> Result<Enqueued> {
        self.inner.lock().errors.remove(&page);
        self.enqueue(page, EnqueueOptions::front().forced())
    }

    /// Queue a verification of the page's current translation.
    pub fn verify_page(&self, page: PageNumber) -> Result<Enqueued> {
        let translated = self.inner.lock().document.is_translated(page);
        if !translated {
            return Ok(Enqueued::Skipped);
        }
        let job = Job {
            page,
            task: Task::Verify {
                after_fix: false,
                changed: None,
            },
        };
        self.submit_job(job, EnqueueOptions::front())
    }

    /// Re-translate the page with its verification findings as guidance,
    /// then verify once more.
    pub fn fix_page(&self, page: PageNumber) -> Result<Enqueued> {
        let hint = {
            let state = self.inner.lock();
            if !state.document.is_translated(page) {
                return Ok(Enqueued::Skipped);
            }
            fix_hint(&state.document, page)
        };
        let job = Job {
            page,
            task: Task::Translate { hint: Some(hint) },
        };
        self.submit_job(job, EnqueueOptions::front().forced())
    }

    /// Cancel the queued or running job for `page`.
    ///
    /// Returns whether there was anything to cancel.
    pub fn stop(&self, page: PageNumber) -> bool {
        let stopped = {
            let mut state = self.inner.lock();
            let queued = state.queue.remove(page).is_some();
            let active = self.inner.cancel_active(&mut state, page);
            if queued || active {
                state.partial.remove(&page);
                self.inner.emit(SchedulerEvent::Cancelled { page });
                self.inner.emit_if_idle(&state);
            }
            queued || active
        };
        if stopped {
            info!("Stopped job for page {}", page);
            self.inner.pump();
        }
        stopped
    }

    /// Cancel every queued and running job. Returns how many were cancelled.
    pub fn abort_all(&self) -> usize {
        let mut state = self.inner.lock();
        let mut pages: Vec<PageNumber> = state.queue.drain().into_iter().map(|job| job.page).collect();
        let active: Vec<PageNumber> = state.active.keys().copied().collect();
        for page in active {
            self.inner.cancel_active(&mut state, page);
            pages.push(page);
        }
        for page in &pages {
            state.partial.remove(page);
            self.inner.emit(SchedulerEvent::Cancelled { page: *page });
        }
        self.inner.emit_if_idle(&state);
        if !pages.is_empty() {
            info!("Aborted {} jobs", pages.len());
        }
        pages.len()
    }

    /// Stop dispatching new jobs. Running jobs finish; requests still queue.
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        if !state.paused {
            state.paused = true;
            self.inner.emit(SchedulerEvent::Paused);
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            self.inner.emit(SchedulerEvent::Resumed);
        }
        self.inner.pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn queue_stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            active: state.active.len(),
            queued: state.queue.len(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue_stats().is_idle()
    }

    pub fn page_status(&self, page: PageNumber) -> PageStatus {
        Inner::status_of(&self.inner.lock(), page)
    }

    /// Status of every page with a pending job or an error.
    pub fn page_statuses(&self) -> BTreeMap<PageNumber, PageStatus> {
        let state = self.inner.lock();
        let pages: Vec<PageNumber> = state
            .queue
            .pages()
            .chain(state.active.keys().copied())
            .chain(state.errors.keys().copied())
            .collect();
        pages
            .into_iter()
            .map(|page| (page, Inner::status_of(&state, page)))
            .collect()
    }

    /// Text streamed so far for a running translation.
    pub fn partial_translation(&self, page: PageNumber) -> Option<String> {
        self.inner.lock().partial.get(&page).cloned()
    }

    /// Pages with a failed translation, a severe verification or a failed
    /// verification.
    pub fn pages_needing_retry(&self) -> Vec<PageNumber> {
        let state = self.inner.lock();
        let mut pages: Vec<PageNumber> = state.errors.keys().copied().collect();
        pages.extend(
            state
                .document
                .verifications
                .iter()
                .filter(|(_, verification)| verification.needs_retry())
                .map(|(page, _)| *page),
        );
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// Cancel any work on `pages` and clear their translation-derived state.
    pub fn reset_pages(&self, pages: &[PageNumber]) {
        if pages.is_empty() {
            return;
        }
        {
            let mut state = self.inner.lock();
            let mut patch = ProjectPatch::new();
            for &page in pages {
                state.queue.remove(page);
                self.inner.cancel_active(&mut state, page);
                state.errors.remove(&page);
                state.partial.remove(&page);
                patch = patch.clear_page(page);
            }
            self.inner.apply(&mut state, patch);
        }
        self.inner.pump();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Copy of the in-memory project document.
    pub fn snapshot(&self) -> ProjectDocument {
        self.inner.lock().document.clone()
    }

    /// Read the in-memory document without cloning it.
    pub fn with_document<R>(&self, f: impl FnOnce(&ProjectDocument) -> R) -> R {
        f(&self.inner.lock().document)
    }

    /// Apply a user-originated change to the document and forward it to the sink.
    pub fn update(&self, patch: ProjectPatch) {
        if patch.is_empty() {
            return;
        }
        let mut state = self.inner.lock();
        self.inner.apply(&mut state, patch);
    }

    /// Derive a patch from the current document and apply it under one lock.
    pub fn update_with<R>(&self, f: impl FnOnce(&ProjectDocument) -> (ProjectPatch, R)) -> R {
        let mut state = self.inner.lock();
        let (patch, result) = f(&state.document);
        if !patch.is_empty() {
            self.inner.apply(&mut state, patch);
        }
        result
    }

    /// Persist everything forwarded to the sink so far.
    pub async fn persist(&self) -> Result<()> {
        self.inner.sink.flush().await
    }

    fn submit_job(&self, job: Job, options: EnqueueOptions) -> Result<Enqueued> {
        let outcome = {
            let mut state = self.inner.lock();
            check_page(&state.document, job.page)?;
            self.inner.push_job(&mut state, job, options)
        };
        if outcome == Enqueued::Queued || outcome == Enqueued::Promoted {
            self.inner.pump();
        }
        Ok(outcome)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SchedulerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn emit_if_idle(&self, state: &State) {
        if state.active.is_empty() && state.queue.is_empty() {
            self.emit(SchedulerEvent::Idle);
        }
    }

    fn model(&self) -> String {
        self.translator.info().model
    }

    fn status_of(state: &State, page: PageNumber) -> PageStatus {
        PageStatus {
            loading: state.queue.contains(page),
            processing: state.active.contains_key(&page),
            error: state.errors.get(&page).cloned(),
        }
    }

    /// Merge into the in-memory document and forward to the sink.
    fn apply(&self, state: &mut State, patch: ProjectPatch) {
        let document = std::mem::take(&mut state.document);
        state.document = merge_project_data(document, &patch);
        self.sink.submit(patch);
    }

    fn cancel_active(&self, state: &mut State, page: PageNumber) -> bool {
        let Some(active) = state.active.remove(&page) else {
            return false;
        };
        active.token.cancel();
        debug!("Cancelled {} job {} for page {}", active.kind, active.id, page);
        if active.kind == JobKind::Verify {
            // The page was marked as verifying when the job started
            let mut patch = ProjectPatch::new();
            patch.verifications.insert(page, Slot::Remove);
            self.apply(state, patch);
        }
        true
    }

    fn push_job(&self, state: &mut State, job: Job, options: EnqueueOptions) -> Enqueued {
        let page = job.page;

        if options.force {
            if self.cancel_active(state, page) {
                state.partial.remove(&page);
            }
        } else {
            if let Some(tier) = state.queue.position(page) {
                if options.priority == Priority::Front && tier == Priority::Back {
                    state.queue.promote(page);
                    debug!("Promoted page {} to the front of the queue", page);
                    return Enqueued::Promoted;
                }
                return Enqueued::AlreadyPending;
            }
            if state.active.contains_key(&page) {
                return Enqueued::AlreadyPending;
            }
            if job.kind() == JobKind::Translate
                && state.document.is_translated(page)
                && !state.errors.contains_key(&page)
            {
                return Enqueued::Skipped;
            }
        }

        let kind = job.kind();
        state.queue.push(job, options.priority);
        debug!("Queued {} for page {} ({:?})", kind, page, options.priority);
        self.emit(SchedulerEvent::Queued { page, kind });
        Enqueued::Queued
    }

    /// Start queued jobs while the gate is open and slots are free.
    fn pump(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.lock();
            while !state.paused && state.active.len() < self.config.concurrency.max(1) {
                let Some(job) = state.queue.pop() else {
                    break;
                };
                if let Some(dispatch) = self.dispatch(&mut state, job) {
                    started.push(dispatch);
                }
            }
        }

        for dispatch in started {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.run(dispatch).await });
        }
    }

    fn dispatch(&self, state: &mut State, job: Job) -> Option<Dispatch> {
        let page = job.page;
        let translation = state
            .document
            .translations
            .get(&page)
            .filter(|text| !text.trim().is_empty())
            .cloned();

        let mut run_id = None;
        if let Task::Verify { .. } = job.task {
            if translation.is_none() {
                debug!("Skipping verification of untranslated page {}", page);
                return None;
            }
            let id = Uuid::new_v4().to_string();
            let verifying = Verification {
                state: VerificationState::Verifying,
                run_id: Some(id.clone()),
                started_at: Some(Utc::now()),
                ..Verification::default()
            };
            self.apply(state, ProjectPatch::new().verification(page, verifying));
            run_id = Some(id);
        }

        state.next_id += 1;
        let id = state.next_id;
        let token = CancellationToken::new();
        let kind = job.kind();
        state.active.insert(
            page,
            ActiveJob {
                id,
                kind,
                token: token.clone(),
            },
        );
        if kind != JobKind::Verify {
            state.errors.remove(&page);
        }
        self.emit(SchedulerEvent::Started { page, kind });
        debug!("Started {} job {} for page {}", kind, id, page);

        Some(Dispatch {
            rotation: state.document.rotation(page),
            replacement: state.document.page_replacements.get(&page).cloned(),
            translation,
            run_id,
            job,
            id,
            token,
        })
    }

    async fn run(self: Arc<Self>, dispatch: Dispatch) {
        let page = dispatch.job.page;
        let id = dispatch.id;
        let token = dispatch.token.clone();

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!("Job {} for page {} abandoned", id, page);
                return;
            }
            outcome = self.execute(dispatch) => outcome,
        };

        self.settle(page, id, outcome);
        self.pump();
    }

    async fn execute(self: &Arc<Self>, dispatch: Dispatch) -> Outcome {
        let Dispatch {
            job,
            id,
            rotation,
            replacement,
            translation,
            run_id,
            ..
        } = dispatch;
        let page = job.page;

        let input = self
            .source
            .page_input(page, rotation, replacement.as_ref())
            .await;

        match job.task {
            Task::Translate { hint } => {
                let input = match input {
                    Ok(input) => input,
                    Err(e) => return Outcome::TranslateFailed(e),
                };
                let inner = Arc::clone(self);
                let on_chunk = move |text: &str| inner.record_partial(page, id, text);
                let fix = hint.is_some();
                match self
                    .translator
                    .translate(
                        &input,
                        &self.source_lang,
                        &self.target_lang,
                        hint.as_ref(),
                        Some(&on_chunk as &ChunkCallback),
                    )
                    .await
                {
                    Ok(result) => Outcome::Translated {
                        translation: result,
                        previous: translation,
                        fix,
                    },
                    Err(e) => Outcome::TranslateFailed(e),
                }
            }
            Task::Verify { after_fix, changed } => {
                let input = match input {
                    Ok(input) => input,
                    Err(error) => return Outcome::VerifyFailed { error, run_id },
                };
                let translated = translation.unwrap_or_default();
                match self
                    .translator
                    .verify(&translated, &input, &self.source_lang, &self.target_lang)
                    .await
                {
                    Ok(report) => Outcome::Verified {
                        report,
                        after_fix,
                        changed,
                        run_id,
                    },
                    Err(error) => Outcome::VerifyFailed { error, run_id },
                }
            }
        }
    }

    fn record_partial(&self, page: PageNumber, id: u64, text: &str) {
        let mut state = self.lock();
        if state.active.get(&page).is_some_and(|active| active.id == id) {
            state.partial.insert(page, text.to_string());
            self.emit(SchedulerEvent::Partial {
                page,
                text: text.to_string(),
            });
        }
    }

    /// Commit a finished job, unless it was cancelled in the meantime.
    fn settle(&self, page: PageNumber, id: u64, outcome: Outcome) {
        let mut state = self.lock();
        if !state.active.get(&page).is_some_and(|active| active.id == id) {
            debug!("Discarding result of cancelled job {} for page {}", id, page);
            return;
        }
        state.active.remove(&page);

        match outcome {
            Outcome::Translated {
                translation,
                previous,
                fix,
            } => self.commit_translation(&mut state, page, translation, previous, fix),
            Outcome::TranslateFailed(error) => {
                warn!("Translation of page {} failed: {}", page, error);
                state.partial.remove(&page);
                state.errors.insert(page, error.to_string());
                self.emit(SchedulerEvent::Failed {
                    page,
                    error: error.to_string(),
                });
            }
            Outcome::Verified {
                report,
                after_fix,
                changed,
                run_id,
            } => self.commit_verification(&mut state, page, report, after_fix, changed, run_id),
            Outcome::VerifyFailed { error, run_id } => {
                warn!("Verification of page {} failed: {}", page, error);
                let started_at = state
                    .document
                    .verifications
                    .get(&page)
                    .and_then(|v| v.started_at);
                let failed = Verification {
                    state: VerificationState::Failed,
                    summary: Some(error.to_string()),
                    run_id,
                    started_at,
                    ..Verification::default()
                };
                self.apply(&mut state, ProjectPatch::new().verification(page, failed));
                self.emit(SchedulerEvent::VerificationFailed {
                    page,
                    error: error.to_string(),
                });
            }
        }

        self.emit_if_idle(&state);
    }

    fn commit_translation(
        &self,
        state: &mut State,
        page: PageNumber,
        translation: PageTranslation,
        previous: Option<String>,
        fix: bool,
    ) {
        let changed = previous
            .as_deref()
            .map(|before| before.trim() != translation.text.trim());
        let blank = translation.is_blank();
        let patch = ProjectPatch::new().translation(
            page,
            translation.text,
            translation.annotations,
            ContentMeta::now(self.model()),
        );
        self.apply(state, patch);
        state.partial.remove(&page);
        state.errors.remove(&page);
        info!("Translated page {}", page);
        self.emit(SchedulerEvent::Translated { page });

        if blank || state.queue.contains(page) {
            return;
        }
        let follow_up = if fix {
            Some(Task::Verify {
                after_fix: true,
                changed,
            })
        } else if self.config.verify_after_translate {
            Some(Task::Verify {
                after_fix: false,
                changed: None,
            })
        } else {
            None
        };
        if let Some(task) = follow_up {
            self.push_job(state, Job { page, task }, EnqueueOptions::front());
        }
    }

    fn commit_verification(
        &self,
        state: &mut State,
        page: PageNumber,
        report: VerificationReport,
        after_fix: bool,
        changed: Option<bool>,
        run_id: Option<String>,
    ) {
        if !state.document.is_translated(page) {
            debug!("Page {} lost its translation during verification", page);
            return;
        }

        let severe = report.severity == Severity::Severe;
        let started_at = state
            .document
            .verifications
            .get(&page)
            .and_then(|v| v.started_at);
        let verification = Verification {
            state: VerificationState::Verified,
            severity: Some(report.severity),
            summary: Some(report.summary).filter(|s| !s.trim().is_empty()),
            evidence: report.evidence,
            changed,
            post_retry_failed: (after_fix && severe).then_some(true),
            run_id,
            started_at,
        };

        let mut patch = ProjectPatch::new()
            .verification(page, verification)
            .verification_meta(page, ContentMeta::now(self.model()));
        if !report.annotations.is_empty() {
            let mut annotations = state
                .document
                .annotations
                .get(&page)
                .cloned()
                .unwrap_or_default();
            annotations.extend(report.annotations);
            patch = patch.annotations(page, annotations);
        }
        self.apply(state, patch);

        if severe {
            if after_fix {
                warn!("Page {} is still severe after the corrective pass", page);
            } else {
                warn!("Verification flagged page {} as severe", page);
            }
        }
        self.emit(SchedulerEvent::Verified {
            page,
            severity: report.severity,
            post_retry_failed: after_fix && severe,
        });

        if severe && !after_fix && self.config.auto_fix_severe {
            let job = Job {
                page,
                task: Task::Translate {
                    hint: Some(fix_hint(&state.document, page)),
                },
            };
            self.push_job(state, job, EnqueueOptions::front().forced());
        }
    }
}

fn check_page(document: &ProjectDocument, page: PageNumber) -> Result<()> {
    let total = document.total_pages;
    if page == 0 || (total > 0 && page > total) {
        return Err(Error::InvalidPage { page, total });
    }
    Ok(())
}

fn fix_hint(document: &ProjectDocument, page: PageNumber) -> FixHint {
    let verification = document.verifications.get(&page);
    FixHint {
        summary: verification.and_then(|v| v.summary.clone()),
        evidence: verification.map(|v| v.evidence.clone()).unwrap_or_default(),
        previous_translation: document.translations.get(&page).cloned(),
    }
}
