//! Remote shell command building.
//!
//! Every remote action is a POSIX `sh` command line. This module keeps the
//! quoting rules in one place so job and snapshot code never concatenate
//! untrusted strings into a command.
//!
//! # Home-relative paths
//!
//! Paths beginning with `~/` are rendered as `"$HOME"/'rest'` so the remote
//! shell expands the home directory while the rest stays quoted.

use crate::error::{RemoteError, Result};

/// Quote a single word for a POSIX shell.
pub fn quote(word: &str) -> Result<String> {
    shlex::try_quote(word)
        .map(|q| q.into_owned())
        .map_err(|_| RemoteError::Config(format!("cannot quote shell word: {word:?}")))
}

/// Render a remote path as a shell word, expanding a leading `~/` remotely.
pub fn remote_path(path: &str) -> Result<String> {
    if path == "~" {
        return Ok("\"$HOME\"".to_string());
    }
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => Ok("\"$HOME\"".to_string()),
        Some(rest) => Ok(format!("\"$HOME\"/{}", quote(rest)?)),
        None => quote(path),
    }
}

/// Strip trailing slashes, keeping a bare `/` intact.
pub fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Split a POSIX path into (parent, final component).
///
/// `"/srv/app/"` becomes `("/srv", "app")`; a bare name has parent `"."`.
pub fn split_path(path: &str) -> (String, String) {
    let path = normalize_path(path);
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => (".".to_string(), path.to_string()),
    }
}

// ============================================================================
// TESTS
// ============================================================================
