//! Append-only JSONL snapshot log.
//!
//! One file per installation. Each line is either a [`SnapshotRecord`] or a
//! [`RemovalMarker`]; the file is never rewritten. Readers parse every line
//! on its own, skip the ones that do not parse, and drop records that a
//! later marker removed.

use chrono::Utc;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::types::{LogEntry, RemovalMarker, SnapshotRecord};
use crate::error::{RemoteError, Result};

pub struct SnapshotLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &SnapshotRecord) -> Result<()> {
        self.append_entries(&[LogEntry::Snapshot(record.clone())])
    }

    /// Hide `ids` from future reads.
    pub fn mark_removed(&self, ids: &[String]) -> Result<()> {
        let now = Utc::now();
        let entries: Vec<LogEntry> = ids
            .iter()
            .map(|id| {
                LogEntry::Removal(RemovalMarker {
                    removed: id.clone(),
                    removed_at: now,
                })
            })
            .collect();
        self.append_entries(&entries)
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    fn lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    /// Every live record, in file order.
    ///
    /// Returns an empty list if the log does not exist yet.
    pub fn records(&self) -> Result<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        let mut removed = HashSet::new();

        for (idx, line) in self.lines()?.iter().enumerate() {
            match serde_json::from_str::<LogEntry>(line) {
                Ok(LogEntry::Snapshot(record)) => records.push(record),
                Ok(LogEntry::Removal(marker)) => {
                    removed.insert(marker.removed);
                }
                Err(_) => log::debug!(
                    "Skipping unparseable line {} in {}",
                    idx + 1,
                    self.path.display()
                ),
            }
        }

        records.retain(|r| !removed.contains(&r.id));
        Ok(records)
    }

    /// Look up `id` among the newest `scan_limit` records.
    ///
    /// A line that carries the id but does not parse as a record yields
    /// `CorruptRecord` instead of `SnapshotNotFound`.
    pub fn find(&self, id: &str, scan_limit: usize) -> Result<SnapshotRecord> {
        let mut records = self.records()?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(record) = records.into_iter().take(scan_limit).find(|r| r.id == id) {
            return Ok(record);
        }

        for line in self.lines()?.iter().rev().take(scan_limit) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            if value.get("id").and_then(|v| v.as_str()) != Some(id) {
                continue;
            }
            if let Err(err) = serde_json::from_value::<SnapshotRecord>(value) {
                return Err(RemoteError::CorruptRecord {
                    id: id.to_string(),
                    message: err.to_string(),
                });
            }
        }

        Err(RemoteError::SnapshotNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::types::SnapshotKind;
    use chrono::Duration;
    use tempfile::tempdir;

    fn record(id: &str, minutes_ago: i64) -> SnapshotRecord {
        SnapshotRecord {
            id: id.to_string(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            host_id: "web1".to_string(),
            path: "/srv/app".to_string(),
            kind: SnapshotKind::Git {
                commit: format!("commit-{id}"),
            },
        }
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::new(dir.path().join("nested/snapshots.jsonl"));
        assert!(log.records().unwrap().is_empty());
    }

    #[test]
    fn append_creates_parent_and_reads_back() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::new(dir.path().join("nested/snapshots.jsonl"));
        log.append(&record("a", 2)).unwrap();
        log.append(&record("b", 1)).unwrap();

        let ids: Vec<String> = log.records().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");
        let log = SnapshotLog::new(&path);
        log.append(&record("a", 1)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, "{{\"half\":").unwrap();
        drop(file);
        log.append(&record("b", 0)).unwrap();

        assert_eq!(log.records().unwrap().len(), 2);
    }

    #[test]
    fn removal_markers_hide_records_without_rewriting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");
        let log = SnapshotLog::new(&path);
        log.append(&record("a", 2)).unwrap();
        log.append(&record("b", 1)).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        log.mark_removed(&["a".to_string()]).unwrap();

        let after = fs::read_to_string(&path).unwrap();
        assert!(after.starts_with(&before));
        let ids: Vec<String> = log.records().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b"]);
        assert!(matches!(log.find("a", 1000), Err(RemoteError::SnapshotNotFound(_))));
    }

    #[test]
    fn find_respects_scan_limit() {
        let dir = tempdir().unwrap();
        let log = SnapshotLog::new(dir.path().join("snapshots.jsonl"));
        log.append(&record("old", 10)).unwrap();
        log.append(&record("new", 0)).unwrap();

        assert_eq!(log.find("old", 2).unwrap().id, "old");
        assert!(matches!(log.find("old", 1), Err(RemoteError::SnapshotNotFound(_))));
    }

    #[test]
    fn record_missing_reference_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots.jsonl");
        fs::write(
            &path,
            "{\"id\":\"broken\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"hostId\":\"h\",\"path\":\"/p\",\"type\":\"archive\"}\n",
        )
        .unwrap();
        let log = SnapshotLog::new(&path);

        assert!(log.records().unwrap().is_empty());
        assert!(matches!(
            log.find("broken", 1000),
            Err(RemoteError::CorruptRecord { id, .. }) if id == "broken"
        ));
        assert!(matches!(log.find("other", 1000), Err(RemoteError::SnapshotNotFound(_))));
    }
}
