use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for page-translator-core
///
/// This enum encompasses all error cases that can occur in the library:
/// - Translation and verification requests against the AI service
/// - Page input preparation (rendering collaborator)
/// - Project store operations (atomic writes, merging, recovery)
/// - Trash lifecycle operations
/// - Configuration operations (loading, validation)
/// - General I/O and JSON operations
#[derive(Error, Debug)]
pub enum Error {
    // ==========================================================================
    // Translation Errors
    // ==========================================================================
    /// Translation API request failed
    #[error("translation API request failed: {0}")]
    TranslationRequest(String),

    /// Invalid response from translation API
    #[error("invalid translation API response: {0}")]
    TranslationInvalidResponse(String),

    /// Rate limited by translation API
    #[error("translation rate limited{}", retry_after.map(|s| format!(", retry after {s} seconds")).unwrap_or_default())]
    TranslationRateLimited { retry_after: Option<u64> },

    /// Translation request timed out
    #[error("translation request timed out")]
    TranslationTimeout,

    /// Maximum retry attempts exceeded for translation
    #[error("translation failed after maximum retries")]
    TranslationMaxRetriesExceeded,

    /// Verification response could not be interpreted
    #[error("invalid verification response: {0}")]
    VerificationInvalidResponse(String),

    // ==========================================================================
    // Page Errors
    // ==========================================================================
    /// Page number outside the document
    #[error("invalid page number {page} (document has {total} pages)")]
    InvalidPage { page: u32, total: u32 },

    /// The rendering collaborator could not produce input for a page
    #[error("failed to prepare page {page}: {reason}")]
    PageSource { page: u32, reason: String },

    /// Character range of a highlight or note is empty or reversed
    #[error("invalid text range {start}..{end}")]
    InvalidRange { start: usize, end: usize },

    /// Rotation other than 0/90/180/270
    #[error("invalid rotation {0} (expected 0, 90, 180 or 270)")]
    InvalidRotation(i64),

    // ==========================================================================
    // Store Errors
    // ==========================================================================
    /// Project document not found
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// A project with this identifier already exists
    #[error("project already exists: {0}")]
    ProjectExists(String),

    /// Invalid project identifier
    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    /// Atomic write failed; the previous target is untouched
    #[error("failed to write {}: {reason}", path.display())]
    StoreWrite { path: PathBuf, reason: String },

    /// Persisted state could not be parsed
    #[error("corrupted project data at {}: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },

    // ==========================================================================
    // Trash Errors
    // ==========================================================================
    /// Trash holding folder not found
    #[error("trash entry not found: {0}")]
    TrashNotFound(String),

    /// Restore target is occupied
    #[error("cannot restore {trash_id}: project {file_id} already exists")]
    RestoreConflict { trash_id: String, file_id: String },

    /// Holding folder has no project document
    #[error("trash entry {0} has no project document")]
    TrashEntryInvalid(String),

    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    /// Failed to load configuration file
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Invalid configuration value
    #[error("invalid config value for '{field}': {reason}")]
    ConfigInvalid { field: String, reason: String },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
