//! Page Translator Core Library
//!
//! This library provides the core functionality for translating documents
//! page by page:
//! - Job scheduling of page translations and verifications
//! - Orchestration policy (prefetch, translate all, retry, fix)
//! - Translation via OpenAI-compatible APIs
//! - Durable project storage with atomic writes, recovery and a trash

pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod orchestrator;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod translator;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::{
    AppConfig, Lang, OrchestrationConfig, SchedulerConfig, StorageConfig, TranslatorConfig,
};
pub use error::{Error, Result};
pub use export::{ExportOptions, export_markdown};
pub use model::{PageNumber, ProjectDocument, ProjectPatch, Rotation, Slot};
pub use orchestrator::{LayoutMode, Orchestrator, RunOutcome, TranslateAll};
pub use scheduler::{
    EnqueueOptions, Enqueued, PageStatus, PatchSink, Priority, QueueStats, Scheduler,
    SchedulerEvent,
};
pub use source::{PageInput, PageSource};
pub use store::{ProjectStore, ProjectSummary, SaveBuffer};
pub use translator::{OpenAiTranslator, Translator, create_translator};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// An opened project: scheduler, orchestration and debounced persistence
/// wired together.
pub struct Session {
    pub orchestrator: Orchestrator,
    buffer: Arc<SaveBuffer>,
    flusher: JoinHandle<()>,
}

impl Session {
    /// Load `file_id` from the store and start scheduling against it.
    pub async fn open(
        store: Arc<ProjectStore>,
        file_id: &str,
        translator: Arc<dyn Translator>,
        source: Arc<dyn PageSource>,
        config: &AppConfig,
    ) -> Result<Self> {
        let document = store.load(file_id).await?;
        info!(
            "Opened {} ({} of {} pages translated)",
            file_id,
            document.translated_count(),
            document.total_pages
        );

        let buffer = SaveBuffer::new(store, file_id, config.storage.flush_delay());
        let flusher = buffer.spawn_flusher();
        let scheduler = Scheduler::new(
            document,
            translator,
            source,
            Arc::clone(&buffer) as Arc<dyn PatchSink>,
            config,
        );

        Ok(Self {
            orchestrator: Orchestrator::new(scheduler, config.orchestration.clone()),
            buffer,
            flusher,
        })
    }

    pub const fn scheduler(&self) -> &Scheduler {
        self.orchestrator.scheduler()
    }

    /// Pending or in-progress writes.
    pub fn is_saving(&self) -> bool {
        self.buffer.is_busy()
    }

    /// Cancel outstanding jobs and write everything still buffered.
    pub async fn close(self) -> Result<()> {
        self.orchestrator.stop_all();
        let result = self.buffer.flush().await.map(|_| ());
        self.flusher.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.source_lang.as_str(), "auto");
        assert_eq!(config.target_lang.as_str(), "en");
        assert_eq!(config.scheduler.concurrency, 2);
    }
}
