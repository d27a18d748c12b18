//! Crash-safe file replacement.
//!
//! Content is written to a uniquely named sibling (`<name>.<tag>.tmp`),
//! synced, then renamed over the target. The temp file disappears only
//! through that rename, so an interrupted or failed write always leaves
//! both the previous target and the complete temp file for recovery.

use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Suffix shared by every in-flight write.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Build a fresh temp path beside `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("file");
    let tag = uuid::Uuid::new_v4().simple().to_string();
    target.with_file_name(format!("{name}.{}{TEMP_SUFFIX}", &tag[..12]))
}

/// Recover the target file name from a temp file name.
///
/// `doc.json.1a2b3c4d5e6f.tmp` yields `doc.json`; names without the temp
/// suffix or tag yield `None`.
pub fn target_name_of_temp(temp_name: &str) -> Option<&str> {
    let stem = temp_name.strip_suffix(TEMP_SUFFIX)?;
    let (target, tag) = stem.rsplit_once('.')?;
    if target.is_empty() || tag.is_empty() || !tag.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(target)
}

/// Atomically replace `target` with `content`.
pub fn atomic_write(target: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| write_error(target, &e))?;
    }

    let temp = temp_path_for(target);
    {
        let mut file = fs::File::create(&temp).map_err(|e| write_error(&temp, &e))?;
        file.write_all(content).map_err(|e| write_error(&temp, &e))?;
        file.flush().map_err(|e| write_error(&temp, &e))?;
        file.sync_all().map_err(|e| write_error(&temp, &e))?;
    }

    if let Err(e) = fs::rename(&temp, target) {
        // Leave the temp in place: recovery decides whether it wins.
        error!(
            "Failed to move {} over {}: {}",
            temp.display(),
            target.display(),
            e
        );
        return Err(write_error(target, &e));
    }

    sync_parent_dir(target);
    debug!("Wrote {} ({} bytes)", target.display(), content.len());
    Ok(())
}

/// Rename `from` to `to`, creating the destination's parent directory.
pub fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)?;
    sync_parent_dir(to);
    Ok(())
}

fn write_error(path: &Path, e: &std::io::Error) -> Error {
    Error::StoreWrite {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
