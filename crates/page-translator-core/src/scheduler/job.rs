use crate::model::{PageNumber, Severity};
use crate::translator::FixHint;

/// Queue tier. Front jobs are always served before back jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Re-run even if the page is already translated or has a pending job
    pub force: bool,
}

impl EnqueueOptions {
    pub const fn front() -> Self {
        Self {
            priority: Priority::Front,
            force: false,
        }
    }

    pub const fn back() -> Self {
        Self {
            priority: Priority::Back,
            force: false,
        }
    }

    #[must_use]
    pub const fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// What an enqueue request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// An existing back job moved to the front tier
    Promoted,
    /// A job for the page is already queued or running
    AlreadyPending,
    /// The page is already translated
    Skipped,
}

/// Work to perform for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Translate the page; with a hint this is the corrective pass
    Translate { hint: Option<FixHint> },
    /// Verify the current translation
    Verify {
        after_fix: bool,
        /// Whether the corrective pass changed the text
        changed: Option<bool>,
    },
}

impl Task {
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Translate { hint: None } => JobKind::Translate,
            Self::Translate { hint: Some(_) } => JobKind::Fix,
            Self::Verify { .. } => JobKind::Verify,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Translate,
    Fix,
    Verify,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Translate => "translate",
            Self::Fix => "fix",
            Self::Verify => "verify",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub page: PageNumber,
    pub task: Task,
}

impl Job {
    pub const fn translate(page: PageNumber) -> Self {
        Self {
            page,
            task: Task::Translate { hint: None },
        }
    }

    pub const fn kind(&self) -> JobKind {
        self.task.kind()
    }
}

/// Per-page view of scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageStatus {
    /// A job for the page is waiting in the queue
    pub loading: bool,
    /// A job for the page is running
    pub processing: bool,
    /// Cause of the last failed translation
    pub error: Option<String>,
}

impl PageStatus {
    pub const fn is_pending(&self) -> bool {
        self.loading || self.processing
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub active: usize,
    pub queued: usize,
}

impl QueueStats {
    pub const fn is_idle(&self) -> bool {
        self.active == 0 && self.queued == 0
    }
}

/// Broadcast to observers as jobs move through the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Queued { page: PageNumber, kind: JobKind },
    Started { page: PageNumber, kind: JobKind },
    /// Streamed translation text so far
    Partial { page: PageNumber, text: String },
    Translated { page: PageNumber },
    Verified {
        page: PageNumber,
        severity: Severity,
        post_retry_failed: bool,
    },
    VerificationFailed { page: PageNumber, error: String },
    Failed { page: PageNumber, error: String },
    Cancelled { page: PageNumber },
    Paused,
    Resumed,
    /// Nothing queued and nothing running
    Idle,
}
