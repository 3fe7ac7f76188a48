//! Audit trail of executed commands.
//!
//! One append-only `{host}.jsonl` file per host under the audit directory.
//! Each line is an [`AuditRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::Result;
use crate::exec::ExecutionResult;

/// Characters of combined output kept in a record.
pub const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub user: String,
    pub output_excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<bool>,
}

impl AuditRecord {
    pub fn from_execution(host: &str, user: &str, command: &str, result: &ExecutionResult) -> Self {
        let sudo = command.trim_start().starts_with("sudo ").then_some(true);
        Self {
            timestamp: Utc::now(),
            host: host.to_string(),
            command: command.to_string(),
            exit_code: result.exit_code,
            duration_ms: result.duration.as_millis() as u64,
            user: user.to_string(),
            output_excerpt: result.combined_excerpt(EXCERPT_CHARS),
            sudo,
        }
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Local JSONL audit files, one per host. File handles stay open once used.
pub struct JsonlAuditLog {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl JsonlAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn host_file(&self, host: &str) -> PathBuf {
        let safe: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        if !files.contains_key(&record.host) {
            fs::create_dir_all(&self.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.host_file(&record.host))?;
            files.insert(record.host.clone(), file);
        }
        if let Some(file) = files.get_mut(&record.host) {
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }
}
