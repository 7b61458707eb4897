//! XDG directory helpers for config locations.

use std::path::PathBuf;

/// Base directory for configuration.
///
/// Uses `DIRREPL_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/dirrepl`
/// or `~/.config/dirrepl`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DIRREPL_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("dirrepl")
}

/// Default directory for rolling log files: `$XDG_DATA_HOME/dirrepl/logs`
/// or `~/.local/share/dirrepl/logs`.
pub(crate) fn log_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("dirrepl")
        .join("logs")
}
