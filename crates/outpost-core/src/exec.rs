//! Command execution over pooled sessions.
//!
//! [`CommandExecutor`] is the only component that talks to sessions. Job and
//! snapshot code build on it and never acquire sessions themselves.
//!
//! Two modes:
//!
//! - [`CommandExecutor::run`] buffers all output and returns it at the end
//! - [`CommandExecutor::run_streaming`] also hands each chunk to a callback
//!   as it arrives, before the final result is produced
//!
//! A non-zero exit status is reported in [`ExecutionResult::exit_code`], not
//! as an error. [`CommandExecutor::run_checked`] is the strict variant for
//! internal callers whose remote step must succeed.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{RemoteError, Result};
use crate::pool::ConnectionPool;
use crate::transport::{OutputChunk, StreamKind};

/// Captured outcome of one command invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(serialize_with = "serialize_lossy")]
    pub stdout: Vec<u8>,
    #[serde(serialize_with = "serialize_lossy")]
    pub stderr: Vec<u8>,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    #[serde(rename = "durationMs", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_lossy<S: serde::Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ExecutionResult {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, cut to at most `max_chars` characters.
    pub fn combined_excerpt(&self, max_chars: usize) -> String {
        let mut text = self.stdout_text();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr_text());
        }
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => text[..idx].to_string(),
            None => text,
        }
    }
}

pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run a command and buffer its output.
    pub async fn run(&self, host_id: &str, command: &str) -> Result<ExecutionResult> {
        self.run_streaming(host_id, command, |_, _| {}).await
    }

    /// Run a command, calling `on_chunk` for every piece of output in
    /// arrival order. All callbacks complete before this returns.
    pub async fn run_streaming<F>(
        &self,
        host_id: &str,
        command: &str,
        mut on_chunk: F,
    ) -> Result<ExecutionResult>
    where
        F: FnMut(&[u8], StreamKind) + Send,
    {
        let lease = self.pool.acquire(host_id).await?;
        let started = Instant::now();
        log::debug!("[{host_id}] exec: {command}");

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let drain = async {
            while let Some(chunk) = rx.recv().await {
                on_chunk(&chunk.data, chunk.stream);
                match chunk.stream {
                    StreamKind::Stdout => stdout.extend_from_slice(&chunk.data),
                    StreamKind::Stderr => stderr.extend_from_slice(&chunk.data),
                }
            }
        };
        let (outcome, ()) = tokio::join!(lease.session().exec(command, tx), drain);
        lease.touch();

        let exit_code = match outcome {
            Ok(code) => code,
            Err(err) => {
                if err.is_transport_failure() {
                    log::warn!("[{host_id}] session failed mid-command: {err}");
                    self.pool.invalidate(host_id).await;
                }
                return Err(err);
            }
        };

        let duration = started.elapsed();
        log::debug!(
            "[{host_id}] exit={exit_code:?} in {}ms",
            duration.as_millis()
        );

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
            duration,
        })
    }

    /// Run a command that must exit 0; anything else is `ExecFailed`.
    pub async fn run_checked(&self, host_id: &str, command: &str) -> Result<ExecutionResult> {
        let result = self.run(host_id, command).await?;
        if result.success() {
            Ok(result)
        } else {
            let stderr = result.stderr_text();
            Err(RemoteError::exec_failed(
                host_id,
                format!(
                    "exit {}: {}",
                    result
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    stderr.trim()
                ),
            ))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
