//! Startup reconciliation of interrupted writes.
//!
//! A temp file left beside a document means a write was interrupted between
//! the temp being written and the rename. Each one is either promoted over
//! its target, set aside as stale, or set aside as corrupted. Nothing is
//! deleted unless it has outlived its retention window.
//!
//! Ordering relies on file modification times. On filesystems with coarse
//! timestamps a temp written in the same tick as its target compares equal
//! and is treated as stale.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::atomic::{move_path, target_name_of_temp};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::util::{age, unix_millis};

const BACKUP_MARKER: &str = "bak";
const CORRUPTED_MARKER: &str = "corrupted";
const STALE_MARKER: &str = "stale";
const ASIDE_MARKERS: [&str; 3] = [BACKUP_MARKER, CORRUPTED_MARKER, STALE_MARKER];

/// Retention windows applied during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Corrupted temps older than this are purged instead of set aside
    pub corrupt_retention: Duration,
    /// Backup, corrupted and stale siblings older than this are purged
    pub sibling_retention: Duration,
    /// Trash holding folders older than this are purged
    pub trash_retention: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for RecoveryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            corrupt_retention: config.corrupt_retention(),
            sibling_retention: config.sibling_retention(),
            trash_retention: config.trash_retention(),
        }
    }
}

/// What recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Targets that received a newer temp
    pub promoted: Vec<PathBuf>,
    /// Where stale temps were moved
    pub stale: Vec<PathBuf>,
    /// Where unparseable temps were moved
    pub corrupted: Vec<PathBuf>,
    /// Files deleted for exceeding retention
    pub purged: usize,
    /// Incomplete asset writes that were discarded
    pub discarded_assets: usize,
    /// Trash holding folders purged for exceeding retention
    pub expired_trash: usize,
}

/// Decision for one orphaned temp file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempVerdict {
    Promote,
    SetAsideStale,
    SetAsideCorrupted,
    Purge,
}

/// Decide what to do with an orphaned temp file.
pub fn classify_temp(
    parseable: bool,
    temp_modified: SystemTime,
    target_modified: Option<SystemTime>,
    now: SystemTime,
    policy: &RecoveryPolicy,
) -> TempVerdict {
    if !parseable {
        if age(now, temp_modified) > policy.corrupt_retention {
            return TempVerdict::Purge;
        }
        return TempVerdict::SetAsideCorrupted;
    }
    match target_modified {
        Some(target) if temp_modified <= target => TempVerdict::SetAsideStale,
        _ => TempVerdict::Promote,
    }
}

struct OrphanedTemp {
    path: PathBuf,
    target: PathBuf,
    modified: SystemTime,
}

/// Reconcile every orphaned temp file in `dir`.
///
/// Temps for the same target are handled oldest first, so when several
/// survive a crash the newest one ends up promoted.
pub fn recover_orphaned_writes(
    dir: &Path,
    policy: &RecoveryPolicy,
    now: SystemTime,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut orphans = find_orphaned_temps(dir)?;
    orphans.sort_by_key(|orphan| orphan.modified);

    for orphan in orphans {
        let parseable = fs::read(&orphan.path)
            .ok()
            .is_some_and(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).is_ok());
        let target_modified = fs::metadata(&orphan.target)
            .and_then(|m| m.modified())
            .ok();

        match classify_temp(parseable, orphan.modified, target_modified, now, policy) {
            TempVerdict::Purge => {
                warn!("Purging expired corrupted temp {}", orphan.path.display());
                fs::remove_file(&orphan.path)?;
                report.purged += 1;
            }
            TempVerdict::SetAsideCorrupted => {
                let aside = aside_path(&orphan.target, CORRUPTED_MARKER, now);
                warn!(
                    "Temp {} is unreadable, moving to {}",
                    orphan.path.display(),
                    aside.display()
                );
                move_path(&orphan.path, &aside)?;
                report.corrupted.push(aside);
            }
            TempVerdict::SetAsideStale => {
                let aside = aside_path(&orphan.target, STALE_MARKER, now);
                info!(
                    "Temp {} is older than {}, moving to {}",
                    orphan.path.display(),
                    orphan.target.display(),
                    aside.display()
                );
                move_path(&orphan.path, &aside)?;
                report.stale.push(aside);
            }
            TempVerdict::Promote => {
                if orphan.target.exists() {
                    let backup = aside_path(&orphan.target, BACKUP_MARKER, now);
                    move_path(&orphan.target, &backup)?;
                    debug!("Backed up {} to {}", orphan.target.display(), backup.display());
                }
                move_path(&orphan.path, &orphan.target)?;
                info!("Recovered {} from interrupted write", orphan.target.display());
                report.promoted.push(orphan.target);
            }
        }
    }

    Ok(report)
}

/// Delete backup, corrupted and stale siblings older than the retention window.
pub fn sweep_aged_siblings(dir: &Path, policy: &RecoveryPolicy, now: SystemTime) -> Result<usize> {
    let mut purged = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_aside_name(name) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if age(now, modified) > policy.sibling_retention {
            debug!("Purging aged sibling {}", entry.path().display());
            fs::remove_file(entry.path())?;
            purged += 1;
        }
    }
    Ok(purged)
}

/// Delete temp files left anywhere under an asset tree.
///
/// An asset is only referenced by a document after its write completed, so
/// an orphaned asset temp is never referenced and the previous file, if any,
/// is still intact.
pub fn discard_orphaned_asset_temps(dir: &Path) -> Result<usize> {
    let mut discarded = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            discarded += discard_orphaned_asset_temps(&entry.path())?;
            continue;
        }
        let is_temp = entry
            .file_name()
            .to_str()
            .and_then(target_name_of_temp)
            .is_some();
        if file_type.is_file() && is_temp {
            warn!("Discarding incomplete asset write {}", entry.path().display());
            fs::remove_file(entry.path())?;
            discarded += 1;
        }
    }
    Ok(discarded)
}

fn find_orphaned_temps(dir: &Path) -> Result<Vec<OrphanedTemp>> {
    let mut orphans = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(target_name) = name.to_str().and_then(target_name_of_temp) else {
            continue;
        };
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        orphans.push(OrphanedTemp {
            path: entry.path(),
            target: dir.join(target_name),
            modified: metadata.modified()?,
        });
    }
    Ok(orphans)
}

/// `<target>.<marker>-<millis>`, with a counter appended if that name is taken.
fn aside_path(target: &Path, marker: &str, now: SystemTime) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let base = format!("{name}.{marker}-{}", unix_millis(now));
    let mut candidate = target.with_file_name(&base);
    let mut counter = 1;
    while candidate.exists() {
        candidate = target.with_file_name(format!("{base}-{counter}"));
        counter += 1;
    }
    candidate
}

fn is_aside_name(name: &str) -> bool {
    ASIDE_MARKERS.iter().any(|marker| {
        name.rsplit_once(&format!(".{marker}-"))
            .is_some_and(|(_, rest)| rest.chars().next().is_some_and(|c| c.is_ascii_digit()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::atomic::temp_path_for;
    use filetime::{FileTime, set_file_mtime};

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn set_mtime(path: &Path, at: SystemTime) {
        set_file_mtime(path, FileTime::from_system_time(at)).unwrap();
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_classify_temp() {
        let policy = RecoveryPolicy::default();
        let now = SystemTime::now();
        let t = now - HOUR;

        assert_eq!(classify_temp(true, t, None, now, &policy), TempVerdict::Promote);
        assert_eq!(classify_temp(true, t, Some(t - HOUR), now, &policy), TempVerdict::Promote);
        assert_eq!(classify_temp(true, t, Some(t), now, &policy), TempVerdict::SetAsideStale);
        assert_eq!(classify_temp(true, t - HOUR, Some(t), now, &policy), TempVerdict::SetAsideStale);
        assert_eq!(classify_temp(false, t, Some(t), now, &policy), TempVerdict::SetAsideCorrupted);
        assert_eq!(classify_temp(false, now - 8 * DAY, None, now, &policy), TempVerdict::Purge);
    }

    #[test]
    fn test_older_temp_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        let temp = temp_path_for(&target);
        let t = SystemTime::now() - HOUR;

        fs::write(&target, br#"{"v":"current"}"#).unwrap();
        fs::write(&temp, br#"{"v":"older"}"#).unwrap();
        set_mtime(&target, t);
        set_mtime(&temp, t - Duration::from_secs(1));

        let report =
            recover_orphaned_writes(dir.path(), &RecoveryPolicy::default(), SystemTime::now())
                .unwrap();

        assert_eq!(fs::read(&target).unwrap(), br#"{"v":"current"}"#);
        assert!(!temp.exists());
        assert_eq!(report.stale.len(), 1);
        assert_eq!(fs::read(&report.stale[0]).unwrap(), br#"{"v":"older"}"#);
        assert!(report.promoted.is_empty());
    }

    #[test]
    fn test_newer_temp_is_promoted_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        let temp = temp_path_for(&target);
        let t = SystemTime::now() - HOUR;

        fs::write(&target, br#"{"v":"previous"}"#).unwrap();
        fs::write(&temp, br#"{"v":"newer"}"#).unwrap();
        set_mtime(&target, t - Duration::from_secs(1));
        set_mtime(&temp, t);

        let report =
            recover_orphaned_writes(dir.path(), &RecoveryPolicy::default(), SystemTime::now())
                .unwrap();

        assert_eq!(fs::read(&target).unwrap(), br#"{"v":"newer"}"#);
        assert_eq!(report.promoted, vec![target.clone()]);
        let backups: Vec<_> = listing(dir.path())
            .into_iter()
            .filter(|n| n.starts_with("doc.json.bak-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(dir.path().join(&backups[0])).unwrap(), br#"{"v":"previous"}"#);
    }

    #[test]
    fn test_temp_without_target_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fresh.json");
        let temp = temp_path_for(&target);
        fs::write(&temp, b"{}").unwrap();

        let report =
            recover_orphaned_writes(dir.path(), &RecoveryPolicy::default(), SystemTime::now())
                .unwrap();

        assert!(target.is_file());
        assert_eq!(report.promoted.len(), 1);
        assert_eq!(listing(dir.path()), vec!["fresh.json".to_string()]);
    }

    #[test]
    fn test_corrupted_temp_kept_aside_until_expired() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        fs::write(&target, b"{}").unwrap();

        let recent = temp_path_for(&target);
        fs::write(&recent, b"{truncated").unwrap();
        let ancient = temp_path_for(&target);
        fs::write(&ancient, b"{also truncated").unwrap();
        set_mtime(&ancient, SystemTime::now() - 10 * DAY);

        let report =
            recover_orphaned_writes(dir.path(), &RecoveryPolicy::default(), SystemTime::now())
                .unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(report.corrupted.len(), 1);
        assert_eq!(fs::read(&report.corrupted[0]).unwrap(), b"{truncated");
        assert_eq!(fs::read(&target).unwrap(), b"{}");
        assert!(!recent.exists() && !ancient.exists());
    }

    #[test]
    fn test_newest_of_several_temps_wins() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doc.json");
        let t = SystemTime::now() - HOUR;

        let first = temp_path_for(&target);
        fs::write(&first, br#"{"v":1}"#).unwrap();
        set_mtime(&first, t);
        let second = temp_path_for(&target);
        fs::write(&second, br#"{"v":2}"#).unwrap();
        set_mtime(&second, t + Duration::from_secs(10));

        recover_orphaned_writes(dir.path(), &RecoveryPolicy::default(), SystemTime::now()).unwrap();

        assert_eq!(fs::read(&target).unwrap(), br#"{"v":2}"#);
    }

    #[test]
    fn test_sweep_purges_only_aged_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let old_backup = dir.path().join("doc.json.bak-1700000000000");
        let new_stale = dir.path().join("doc.json.stale-1700000000001");
        let live = dir.path().join("doc.json");
        for path in [&old_backup, &new_stale, &live] {
            fs::write(path, b"{}").unwrap();
        }
        set_mtime(&old_backup, now - 31 * DAY);
        set_mtime(&live, now - 90 * DAY);

        let purged = sweep_aged_siblings(dir.path(), &RecoveryPolicy::default(), now).unwrap();

        assert_eq!(purged, 1);
        assert!(!old_backup.exists());
        assert!(new_stale.exists());
        assert!(live.exists());
    }

    #[test]
    fn test_asset_temps_are_discarded_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let sources = dir.path().join("book-1a2b3c4d/sources");
        fs::create_dir_all(&sources).unwrap();
        let image = sources.join("page-0001.png");
        fs::write(&image, b"complete").unwrap();
        let temp = temp_path_for(&image);
        fs::write(&temp, b"compl").unwrap();

        assert_eq!(discard_orphaned_asset_temps(dir.path()).unwrap(), 1);
        assert!(!temp.exists());
        assert_eq!(fs::read(&image).unwrap(), b"complete");
    }

    #[test]
    fn test_is_aside_name() {
        assert!(is_aside_name("doc.json.bak-1700000000000"));
        assert!(is_aside_name("doc.json.corrupted-1700000000000-2"));
        assert!(!is_aside_name("doc.json"));
        assert!(!is_aside_name("bakery-notes.json"));
    }
}
