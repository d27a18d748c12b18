//! Utility functions shared across the crate.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Get the user's config directory following XDG conventions.
///
/// Returns `$XDG_CONFIG_HOME` if set, otherwise `$HOME/.config`.
pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

/// Get the user's data directory following XDG conventions.
///
/// Returns `$XDG_DATA_HOME` if set, otherwise `$HOME/.local/share`.
pub fn data_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_DATA_HOME").map(PathBuf::from).or_else(|| {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("share"))
    })
}

/// Get the default project storage root.
pub fn default_storage_root() -> PathBuf {
    data_dir()
        .unwrap_or_else(|| PathBuf::from(".data"))
        .join("page-translator")
}

/// Milliseconds since the Unix epoch for a point in time (0 before the epoch).
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How long ago `then` was relative to `now` (zero if `then` is in the future).
pub fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or_default()
}
