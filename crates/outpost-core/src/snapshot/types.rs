//! Snapshot records and log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a snapshot was taken, with the reference needed to restore it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Commit in the path's own git working tree.
    Git { commit: String },
    /// Gzipped tarball of the path on the remote host.
    Archive {
        #[serde(rename = "archivePath")]
        archive_path: String,
    },
    /// Copy of a single file on the remote host.
    File {
        #[serde(rename = "backupPath")]
        backup_path: String,
    },
}

impl SnapshotKind {
    pub fn label(&self) -> &'static str {
        match self {
            SnapshotKind::Git { .. } => "git",
            SnapshotKind::Archive { .. } => "archive",
            SnapshotKind::File { .. } => "file",
        }
    }

    /// The commit or remote artifact path this snapshot points at.
    pub fn reference(&self) -> &str {
        match self {
            SnapshotKind::Git { commit } => commit,
            SnapshotKind::Archive { archive_path } => archive_path,
            SnapshotKind::File { backup_path } => backup_path,
        }
    }

    /// Remote file to delete when the snapshot expires. Git snapshots have none.
    pub fn artifact(&self) -> Option<&str> {
        match self {
            SnapshotKind::Git { .. } => None,
            SnapshotKind::Archive { archive_path } => Some(archive_path),
            SnapshotKind::File { backup_path } => Some(backup_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub host_id: String,
    pub path: String,
    #[serde(flatten)]
    pub kind: SnapshotKind,
}

/// Appended by cleanup; hides the named snapshot from readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalMarker {
    pub removed: String,
    pub removed_at: DateTime<Utc>,
}

/// One line of the snapshot log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogEntry {
    Removal(RemovalMarker),
    Snapshot(SnapshotRecord),
}
