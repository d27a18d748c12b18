//! Debounced, coalescing writer for one project.
//!
//! Updates are folded into a single pending patch. A background flusher
//! writes it once no new update has arrived for the quiet period; callers
//! can also flush explicitly (on close, or in tests without real timers).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::ProjectStore;
use crate::error::Result;
use crate::model::ProjectPatch;
use crate::scheduler::PatchSink;

#[derive(Default)]
struct Pending {
    patch: Option<ProjectPatch>,
    generation: u64,
}

pub struct SaveBuffer {
    store: Arc<ProjectStore>,
    file_id: String,
    quiet_period: Duration,
    pending: Mutex<Pending>,
    saving: AtomicBool,
    flushes: AtomicU64,
    /// Only one flush talks to the store at a time
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl SaveBuffer {
    pub fn new(store: Arc<ProjectStore>, file_id: impl Into<String>, quiet_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            file_id: file_id.into(),
            quiet_period,
            pending: Mutex::new(Pending::default()),
            saving: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Queue an update; it is written after the next quiet period.
    pub fn submit(&self, patch: ProjectPatch) {
        if patch.is_empty() {
            return;
        }
        {
            let mut pending = self.lock_pending();
            match pending.patch.as_mut() {
                Some(existing) => existing.absorb(patch),
                None => pending.patch = Some(patch),
            }
            pending.generation += 1;
        }
        self.wake.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        self.lock_pending().patch.is_some()
    }

    /// A write is currently in progress.
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    /// Pending or in-progress work; destructive operations should wait.
    pub fn is_busy(&self) -> bool {
        self.is_saving() || self.has_pending()
    }

    /// Number of successful writes so far.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Write the pending patch now. Returns whether anything was written.
    ///
    /// A failed write keeps the patch pending, ahead of anything submitted
    /// meanwhile, so the next flush retries it.
    pub async fn flush(&self) -> Result<bool> {
        let _guard = self.flush_lock.lock().await;
        let Some(patch) = self.lock_pending().patch.take() else {
            return Ok(false);
        };

        self.saving.store(true, Ordering::SeqCst);
        let result = self.store.save_patch(&self.file_id, &patch).await;
        self.saving.store(false, Ordering::SeqCst);

        match result {
            Ok(_) => {
                self.flushes.fetch_add(1, Ordering::SeqCst);
                debug!("Flushed pending changes for {}", self.file_id);
                Ok(true)
            }
            Err(e) => {
                let mut pending = self.lock_pending();
                let mut restored = patch;
                if let Some(newer) = pending.patch.take() {
                    restored.absorb(newer);
                }
                pending.patch = Some(restored);
                Err(e)
            }
        }
    }

    /// Start the background flusher. Abort the handle to stop it.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                buffer.wake.notified().await;
                // Wait until a full quiet period passes without new updates
                loop {
                    let generation = buffer.generation();
                    tokio::time::sleep(buffer.quiet_period).await;
                    if buffer.generation() == generation {
                        break;
                    }
                }
                if let Err(e) = buffer.flush().await {
                    error!("Failed to save project {}: {}", buffer.file_id, e);
                }
            }
        })
    }

    fn generation(&self) -> u64 {
        self.lock_pending().generation
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PatchSink for SaveBuffer {
    fn submit(&self, patch: ProjectPatch) {
        Self::submit(self, patch);
    }

    async fn flush(&self) -> Result<()> {
        Self::flush(self).await.map(|_| ())
    }
}
