//! Job data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a detached job.
///
/// `Running` moves to exactly one of the terminal states and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal status for a process that exited with `code`.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }

    pub fn is_running(self) -> bool {
        self == JobStatus::Running
    }
}

/// Exit code recorded for jobs terminated through `kill`.
pub const KILLED_EXIT_CODE: i32 = -9;

/// A detached process tracked by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub host_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: JobStatus,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Remote file receiving the job's combined stdout and stderr.
    pub output_path: String,
}

impl JobRecord {
    /// Move a running job into its terminal state. Finished jobs are left
    /// untouched; returns whether anything changed.
    pub fn finish(&mut self, status: JobStatus, exit_code: i32, at: DateTime<Utc>) -> bool {
        if !self.status.is_running() || status.is_running() {
            return false;
        }
        self.status = status;
        self.exit_code = Some(exit_code);
        self.ended_at = Some(at);
        true
    }
}
