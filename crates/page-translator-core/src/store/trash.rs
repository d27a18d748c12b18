//! Reversible project deletion.
//!
//! Deleting a project moves its document and asset directory into a holding
//! folder named `<deleted-at-millis>-<fileId>-<suffix>` under `trash/`.
//! Holding folders are only removed by an explicit purge or once they
//! outlive the retention window.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use super::atomic::move_path;
use super::{DOCUMENT_EXT, ProjectStore, validate_file_id};
use crate::error::{Error, Result};
use crate::model::ProjectDocument;
use crate::util::unix_millis;

const HOLDING_ASSETS_DIR: &str = "assets";

/// A soft-deleted project awaiting restore or purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashEntry {
    pub trash_id: String,
    pub file_id: String,
    pub file_name: Option<String>,
    pub deleted_at: DateTime<Utc>,
}

/// Outcome of restoring every holding folder.
#[derive(Debug, Default)]
pub struct RestoreAllReport {
    pub restored: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

/// Trash operations scoped to one store.
pub struct TrashBin<'a> {
    store: &'a ProjectStore,
}

impl<'a> TrashBin<'a> {
    pub(super) const fn new(store: &'a ProjectStore) -> Self {
        Self { store }
    }

    fn holding_path(&self, trash_id: &str) -> Result<PathBuf> {
        validate_file_id(trash_id).map_err(|_| Error::TrashNotFound(trash_id.to_string()))?;
        let path = self.store.trash_dir().join(trash_id);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(Error::TrashNotFound(trash_id.to_string()))
        }
    }

    /// Move a project into a new holding folder and return its trash id.
    pub async fn delete(&self, file_id: &str) -> Result<String> {
        validate_file_id(file_id)?;
        let lock = self.store.project_lock(file_id);
        let _guard = lock.lock().await;

        let document = self.store.document_path(file_id);
        if !document.is_file() {
            return Err(Error::ProjectNotFound(file_id.to_string()));
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let trash_id = format!(
            "{}-{file_id}-{}",
            unix_millis(SystemTime::now()),
            &suffix[..8]
        );
        let holding = self.store.trash_dir().join(&trash_id);
        fs::create_dir_all(&holding)?;

        let held_document = holding.join(format!("{file_id}{DOCUMENT_EXT}"));
        move_path(&document, &held_document)?;

        let assets = self.store.assets_dir(file_id);
        if assets.is_dir()
            && let Err(e) = move_path(&assets, &holding.join(HOLDING_ASSETS_DIR))
        {
            // Put the document back so the project stays whole.
            move_path(&held_document, &document)?;
            let _ = fs::remove_dir(&holding);
            return Err(e);
        }

        // Interrupted writes and set-aside copies travel with the document,
        // otherwise startup recovery would promote them back into a live project.
        for sibling in document_siblings(&self.store.projects_dir(), file_id)? {
            if let Some(name) = sibling.file_name() {
                move_path(&sibling, &holding.join(name))?;
            }
        }

        info!("Moved project {} to trash as {}", file_id, trash_id);
        Ok(trash_id)
    }

    /// Every holding folder, newest deletion first.
    pub fn list(&self) -> Result<Vec<TrashEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.store.trash_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(trash_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match describe(&entry.path(), &trash_id) {
                Ok(item) => entries.push(item),
                Err(e) => warn!("Skipping trash entry {}: {}", trash_id, e),
            }
        }
        entries.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        Ok(entries)
    }

    /// Move a project back out of the trash.
    ///
    /// Fails without touching anything if the destination is occupied.
    pub async fn restore(&self, trash_id: &str) -> Result<String> {
        let holding = self.holding_path(trash_id)?;
        let file_id = held_file_id(&holding)
            .ok_or_else(|| Error::TrashEntryInvalid(trash_id.to_string()))?;

        let lock = self.store.project_lock(&file_id);
        let _guard = lock.lock().await;

        let document = self.store.document_path(&file_id);
        let assets = self.store.assets_dir(&file_id);
        let held_assets = holding.join(HOLDING_ASSETS_DIR);
        if document.exists() || (held_assets.exists() && assets.exists()) {
            return Err(Error::RestoreConflict {
                trash_id: trash_id.to_string(),
                file_id,
            });
        }

        let held_document = holding.join(format!("{file_id}{DOCUMENT_EXT}"));
        move_path(&held_document, &document)?;
        if held_assets.is_dir()
            && let Err(e) = move_path(&held_assets, &assets)
        {
            move_path(&document, &held_document)?;
            return Err(e);
        }

        let projects = self.store.projects_dir();
        for sibling in document_siblings(&holding, &file_id)? {
            let Some(name) = sibling.file_name() else {
                continue;
            };
            let target = projects.join(name);
            if target.exists() {
                warn!("Leaving {} in trash: {} exists", sibling.display(), target.display());
                continue;
            }
            move_path(&sibling, &target)?;
        }

        if let Err(e) = fs::remove_dir(&holding) {
            warn!("Restored {} but could not remove {}: {}", file_id, holding.display(), e);
        }
        info!("Restored project {} from {}", file_id, trash_id);
        Ok(file_id)
    }

    /// Restore every holding folder, collecting failures instead of stopping.
    pub async fn restore_all(&self) -> Result<RestoreAllReport> {
        let mut report = RestoreAllReport::default();
        for entry in self.list()? {
            match self.restore(&entry.trash_id).await {
                Ok(file_id) => report.restored.push(file_id),
                Err(e) => {
                    warn!("Failed to restore {}: {}", entry.trash_id, e);
                    report.failed.push((entry.trash_id, e));
                }
            }
        }
        Ok(report)
    }

    /// Permanently delete one holding folder.
    pub fn purge(&self, trash_id: &str) -> Result<()> {
        let holding = self.holding_path(trash_id)?;
        fs::remove_dir_all(&holding)?;
        info!("Purged trash entry {}", trash_id);
        Ok(())
    }

    /// Permanently delete every holding folder.
    pub fn empty(&self) -> Result<usize> {
        let entries = self.list()?;
        for entry in &entries {
            self.purge(&entry.trash_id)?;
        }
        Ok(entries.len())
    }

    /// Purge holding folders deleted more than `retention` before `now`.
    pub fn sweep_expired(&self, now: SystemTime, retention: Duration) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| DateTime::<Utc>::from(now).checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut purged = 0;
        for entry in self.list()? {
            if entry.deleted_at < cutoff {
                self.purge(&entry.trash_id)?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Expired {} trash entries", purged);
        }
        Ok(purged)
    }
}

fn describe(holding: &Path, trash_id: &str) -> Result<TrashEntry> {
    let file_id =
        held_file_id(holding).ok_or_else(|| Error::TrashEntryInvalid(trash_id.to_string()))?;

    let deleted_at = trash_id
        .split('-')
        .next()
        .and_then(|millis| millis.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(
            || fs::metadata(holding).and_then(|m| m.modified()).map(DateTime::<Utc>::from),
            Ok,
        )?;

    let file_name = fs::read(holding.join(format!("{file_id}{DOCUMENT_EXT}")))
        .ok()
        .and_then(|bytes| serde_json::from_slice::<ProjectDocument>(&bytes).ok())
        .map(|doc| doc.file_name);

    Ok(TrashEntry {
        trash_id: trash_id.to_string(),
        file_id,
        file_name,
        deleted_at,
    })
}

/// Temp files and set-aside copies of a project's document in `dir`.
fn document_siblings(dir: &Path, file_id: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{file_id}{DOCUMENT_EXT}.");
    let mut siblings = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_sibling = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix));
        if is_sibling && entry.file_type()?.is_file() {
            siblings.push(entry.path());
        }
    }
    Ok(siblings)
}

/// The project id of the single document inside a holding folder.
fn held_file_id(holding: &Path) -> Option<String> {
    fs::read_dir(holding).ok()?.filter_map(|e| e.ok()).find_map(|entry| {
        let name = entry.file_name();
        let file_id = name.to_str()?.strip_suffix(DOCUMENT_EXT)?;
        validate_file_id(file_id).ok()?;
        Some(file_id.to_string())
    })
}
