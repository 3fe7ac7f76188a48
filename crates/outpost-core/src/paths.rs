//! Local filesystem locations.
//!
//! Outpost keeps its configuration, snapshot log and audit files under
//! `~/.config/outpost/` unless the configuration points elsewhere.

use std::env;
use std::path::PathBuf;

use crate::error::{RemoteError, Result};

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Ok(PathBuf::from(profile));
        }
    }

    Err(RemoteError::Config("Home directory not set".to_string()))
}

/// Directory holding Outpost's local state.
pub fn config_dir() -> Result<PathBuf> {
    Ok(get_home_dir()?.join(".config").join("outpost"))
}

/// Expand a leading `~/` against the local home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => Ok(get_home_dir()?.join(rest)),
        None if path == "~" => get_home_dir(),
        None => Ok(PathBuf::from(path)),
    }
}
