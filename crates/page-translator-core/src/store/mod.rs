//! Durable project store.
//!
//! Layout under the storage root:
//!
//! ```text
//! projects/<fileId>.json     one document per project
//! assets/<fileId>/...        images referenced by `pageImages`
//! trash/<holding folder>/    soft-deleted projects
//! ```
//!
//! Every document write goes through [`ProjectStore::save_patch`]: a
//! per-project async lock serializes merges so two writers never interleave,
//! and the merged result is persisted with [`atomic::atomic_write`].

pub mod atomic;
pub mod merge;
pub mod recovery;
pub mod save_buffer;
pub mod trash;

pub use atomic::atomic_write;
pub use merge::merge_project_data;
pub use recovery::{RecoveryPolicy, RecoveryReport};
pub use save_buffer::SaveBuffer;
pub use trash::{TrashBin, TrashEntry};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{PageNumber, ProjectDocument, ProjectPatch, Slot};

const PROJECTS_DIR: &str = "projects";
const ASSETS_DIR: &str = "assets";
const TRASH_DIR: &str = "trash";
const DOCUMENT_EXT: &str = ".json";

/// Which image reference a stored asset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Source,
    Crop,
}

impl ImageKind {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::Source => "sources",
            Self::Crop => "crops",
        }
    }
}

/// Listing entry for a stored project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSummary {
    pub file_id: String,
    pub file_name: String,
    pub total_pages: u32,
    pub translated_pages: usize,
    pub last_page: PageNumber,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&ProjectDocument> for ProjectSummary {
    fn from(doc: &ProjectDocument) -> Self {
        Self {
            file_id: doc.file_id.clone(),
            file_name: doc.file_name.clone(),
            total_pages: doc.total_pages,
            translated_pages: doc.translated_count(),
            last_page: doc.last_page,
            updated_at: doc.updated_at,
        }
    }
}

/// File-backed store holding one JSON document per project.
pub struct ProjectStore {
    root: PathBuf,
    /// Per-project write locks; merges for one project never interleave
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [PROJECTS_DIR, ASSETS_DIR, TRASH_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        debug!("Opened project store at {}", root.display());
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Paths
    // =========================================================================

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join(PROJECTS_DIR)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    pub fn document_path(&self, file_id: &str) -> PathBuf {
        self.projects_dir().join(format!("{file_id}{DOCUMENT_EXT}"))
    }

    pub fn assets_dir(&self, file_id: &str) -> PathBuf {
        self.root.join(ASSETS_DIR).join(file_id)
    }

    pub fn exists(&self, file_id: &str) -> bool {
        self.document_path(file_id).is_file()
    }

    pub fn trash(&self) -> TrashBin<'_> {
        TrashBin::new(self)
    }

    fn project_lock(&self, file_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(file_id.to_string()).or_default())
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Open the project for a source file, creating it on first use.
    pub async fn create_or_open(
        &self,
        file_name: &str,
        original_path: Option<&str>,
        total_pages: u32,
    ) -> Result<ProjectDocument> {
        let file_id = derive_file_id(file_name, original_path);
        let lock = self.project_lock(&file_id);
        let _guard = lock.lock().await;

        let path = self.document_path(&file_id);
        if path.is_file() {
            let existing = read_document(path).await?;
            if total_pages > 0 && existing.total_pages != total_pages {
                let patch = ProjectPatch {
                    total_pages: Some(total_pages),
                    ..Default::default()
                };
                return self.merge_and_write(&file_id, existing, &patch).await;
            }
            return Ok(existing);
        }

        let doc = ProjectDocument::new(
            &file_id,
            file_name,
            original_path.map(str::to_string),
            total_pages,
        );
        write_document(self.document_path(&file_id), &doc).await?;
        info!("Created project {} ({} pages)", file_id, total_pages);
        Ok(doc)
    }

    pub async fn load(&self, file_id: &str) -> Result<ProjectDocument> {
        validate_file_id(file_id)?;
        let path = self.document_path(file_id);
        if !path.is_file() {
            return Err(Error::ProjectNotFound(file_id.to_string()));
        }
        read_document(path).await
    }

    /// Merge a partial update into the stored document and persist it.
    ///
    /// On error the previous document is untouched and the caller keeps its
    /// in-memory state as the source of truth.
    pub async fn save_patch(&self, file_id: &str, patch: &ProjectPatch) -> Result<ProjectDocument> {
        validate_file_id(file_id)?;
        let lock = self.project_lock(file_id);
        let _guard = lock.lock().await;

        let path = self.document_path(file_id);
        if !path.is_file() {
            return Err(Error::ProjectNotFound(file_id.to_string()));
        }
        let existing = read_document(path).await?;
        self.merge_and_write(file_id, existing, patch).await
    }

    async fn merge_and_write(
        &self,
        file_id: &str,
        existing: ProjectDocument,
        patch: &ProjectPatch,
    ) -> Result<ProjectDocument> {
        let mut merged = merge_project_data(existing, patch);
        merged.updated_at = Some(Utc::now());
        write_document(self.document_path(file_id), &merged).await?;
        debug!("Saved project {}", file_id);
        Ok(merged)
    }

    /// Summaries of every live project, sorted by most recent update.
    pub async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        let dir = self.projects_dir();
        let mut summaries = Vec::new();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(file_id) = name.to_str().and_then(|n| n.strip_suffix(DOCUMENT_EXT)) else {
                continue;
            };
            if validate_file_id(file_id).is_err() {
                continue;
            }
            match read_document(entry.path()).await {
                Ok(doc) => summaries.push(ProjectSummary::from(&doc)),
                Err(e) => warn!("Skipping unreadable project {}: {}", file_id, e),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.file_id.cmp(&b.file_id)));
        Ok(summaries)
    }

    /// Rename a project, re-deriving its identifier from the new name.
    pub async fn rename_project(&self, file_id: &str, new_name: &str) -> Result<ProjectDocument> {
        let doc = self.load(file_id).await?;
        let new_id = derive_file_id(new_name, doc.original_file_path.as_deref());

        if new_id == file_id {
            let patch = ProjectPatch {
                file_name: Some(new_name.to_string()),
                ..Default::default()
            };
            return self.save_patch(file_id, &patch).await;
        }

        // Lock both ids, in a fixed order
        let (first, second) = if file_id < new_id.as_str() {
            (file_id, new_id.as_str())
        } else {
            (new_id.as_str(), file_id)
        };
        let first_lock = self.project_lock(first);
        let _first = first_lock.lock().await;
        let second_lock = self.project_lock(second);
        let _second = second_lock.lock().await;

        if self.exists(&new_id) {
            return Err(Error::ProjectExists(new_id));
        }
        if !self.exists(file_id) {
            return Err(Error::ProjectNotFound(file_id.to_string()));
        }

        let mut renamed = read_document(self.document_path(file_id)).await?;
        renamed.file_id.clone_from(&new_id);
        renamed.file_name = new_name.to_string();
        renamed.updated_at = Some(Utc::now());

        write_document(self.document_path(&new_id), &renamed).await?;
        let old_assets = self.assets_dir(file_id);
        if old_assets.is_dir() {
            atomic::move_path(&old_assets, &self.assets_dir(&new_id))?;
        }
        tokio::fs::remove_file(self.document_path(file_id)).await?;

        info!("Renamed project {} -> {}", file_id, new_id);
        Ok(renamed)
    }

    // =========================================================================
    // Assets
    // =========================================================================

    /// Write an image into the project's asset directory and return the
    /// patch that references it.
    pub async fn store_page_image(
        &self,
        file_id: &str,
        page: PageNumber,
        kind: ImageKind,
        bytes: &[u8],
        extension: &str,
    ) -> Result<ProjectPatch> {
        validate_file_id(file_id)?;
        let relative = format!(
            "{}/page-{page:04}.{}",
            kind.dir_name(),
            extension.trim_start_matches('.')
        );
        let target = self.assets_dir(file_id).join(&relative);
        let bytes = bytes.to_vec();
        blocking(move || atomic_write(&target, &bytes)).await?;

        let mut patch = ProjectPatch::new();
        image_slots(&mut patch, kind).insert(page, Slot::Set(relative));
        Ok(patch)
    }

    /// Delete an image asset and return the tombstone patch for its reference.
    pub async fn remove_page_image(
        &self,
        file_id: &str,
        page: PageNumber,
        kind: ImageKind,
    ) -> Result<ProjectPatch> {
        let doc = self.load(file_id).await?;
        let images = match kind {
            ImageKind::Source => &doc.page_images.sources,
            ImageKind::Crop => &doc.page_images.crops,
        };
        if let Some(relative) = images.get(&page) {
            let path = self.assets_dir(file_id).join(relative);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove asset {}: {}", path.display(), e);
            }
        }

        let mut patch = ProjectPatch::new();
        image_slots(&mut patch, kind).insert(page, Slot::Remove);
        Ok(patch)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reconcile interrupted writes, sweep aged siblings and expire old
    /// trash. Run once at startup, before any project is opened.
    pub async fn recover(&self, policy: RecoveryPolicy) -> Result<RecoveryReport> {
        let projects = self.projects_dir();
        let assets = self.root.join(ASSETS_DIR);
        let now = std::time::SystemTime::now();
        let mut report = blocking(move || {
            let mut report = recovery::recover_orphaned_writes(&projects, &policy, now)?;
            report.purged += recovery::sweep_aged_siblings(&projects, &policy, now)?;
            report.discarded_assets = recovery::discard_orphaned_asset_temps(&assets)?;
            Ok(report)
        })
        .await?;
        report.expired_trash = self.trash().sweep_expired(now, policy.trash_retention)?;
        Ok(report)
    }
}

fn image_slots(patch: &mut ProjectPatch, kind: ImageKind) -> &mut crate::model::PagePatch<String> {
    match kind {
        ImageKind::Source => &mut patch.page_images.sources,
        ImageKind::Crop => &mut patch.page_images.crops,
    }
}

/// Derive a stable project identifier from a file name and its original path.
///
/// The readable part is a slug of the file stem; the suffix is a short hash
/// of the path (or the name when no path is known) so two same-named files
/// from different folders stay distinct.
pub fn derive_file_id(file_name: &str, original_path: Option<&str>) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);

    let mut slug = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug: String = slug.trim_matches('-').chars().take(48).collect();
    if slug.is_empty() {
        slug.push_str("document");
    }

    let hash = format!("{:x}", md5::compute(original_path.unwrap_or(file_name).as_bytes()));
    format!("{}-{}", slug.trim_end_matches('-'), &hash[..8])
}

/// Reject identifiers that could escape the store directories.
pub fn validate_file_id(file_id: &str) -> Result<()> {
    let valid = !file_id.is_empty()
        && !file_id.starts_with('.')
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidProjectId(file_id.to_string()))
    }
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

async fn read_document(path: PathBuf) -> Result<ProjectDocument> {
    let bytes = tokio::fs::read(&path).await?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Corrupted {
        path,
        reason: e.to_string(),
    })
}

async fn write_document(path: PathBuf, doc: &ProjectDocument) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    blocking(move || atomic_write(&path, &bytes)).await
}
