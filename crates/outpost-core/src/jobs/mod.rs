//! Detached background jobs on remote hosts.
//!
//! # Overview
//!
//! There is no daemon on the remote side. A job is a process started with
//! `nohup` in the background of a short-lived shell; everything needed to
//! track it lives in three files under the configured job directory:
//!
//! ```text
//! /tmp/outpost-jobs/
//! ├── job-1a2b3c4d.out    # combined stdout + stderr
//! ├── job-1a2b3c4d.pid    # pid of the detached wrapper
//! └── job-1a2b3c4d.exit   # exit status, written when the command ends
//! ```
//!
//! # Status Recovery
//!
//! [`JobSupervisor::get_status`] reads the `.exit` file first. When a
//! process vanished without writing one, the status check falls back to a shell
//! `wait` on the pid; outside the launching session that yields nothing
//! useful, and the job is then recorded as exit 0.
//!
//! # Persistence
//!
//! None. The table is memory-resident; jobs still running remotely when the
//! process exits keep running but are no longer tracked.

mod table;
mod types;

pub use table::JobTable;
pub use types::{JobRecord, JobStatus, KILLED_EXIT_CODE};

use chrono::Utc;
use std::sync::Arc;

use crate::error::{RemoteError, Result};
use crate::exec::CommandExecutor;
use crate::shell;

/// Returned by [`JobSupervisor::get_output`] before the job wrote anything.
pub const NO_OUTPUT_PLACEHOLDER: &str = "(no output yet)";

/// Exit status the output script uses to signal a missing output file.
const MISSING_OUTPUT_STATUS: i32 = 3;

/// `wait` exit status for "not a child of this shell".
const WAIT_NOT_A_CHILD: i32 = 127;

/// Remote files belonging to one job, each already shell-quoted.
struct JobFiles {
    output: String,
    pid: String,
    exit: String,
    exit_tmp: String,
}

/// Result of probing a running job.
#[derive(Debug, PartialEq, Eq)]
enum Liveness {
    Running,
    Exited(i32),
}

pub struct JobSupervisor {
    executor: Arc<CommandExecutor>,
    job_dir: String,
    table: JobTable,
}

impl JobSupervisor {
    /// Create a supervisor. Must be called inside a tokio runtime, since
    /// the job table actor is spawned here.
    pub fn new(executor: Arc<CommandExecutor>, job_dir: impl Into<String>) -> Self {
        Self {
            executor,
            job_dir: shell::normalize_path(&job_dir.into()).to_string(),
            table: JobTable::spawn(),
        }
    }

    fn output_path(&self, id: &str) -> String {
        format!("{}/{id}.out", self.job_dir)
    }

    fn files(&self, id: &str) -> Result<JobFiles> {
        Ok(JobFiles {
            output: shell::remote_path(&self.output_path(id))?,
            pid: shell::remote_path(&format!("{}/{id}.pid", self.job_dir))?,
            exit: shell::remote_path(&format!("{}/{id}.exit", self.job_dir))?,
            exit_tmp: shell::remote_path(&format!("{}/{id}.exit.tmp", self.job_dir))?,
        })
    }

    async fn record(&self, id: &str) -> Result<JobRecord> {
        self.table
            .get(id)
            .await?
            .ok_or_else(|| RemoteError::JobNotFound(id.to_string()))
    }

    /// Launch `command` detached on `host_id`.
    pub async fn start(
        &self,
        host_id: &str,
        command: &str,
        name: Option<&str>,
    ) -> Result<JobRecord> {
        let id = new_job_id();
        let files = self.files(&id)?;
        let script = launch_script(command, &shell::remote_path(&self.job_dir)?, &files)?;

        let result = self.executor.run(host_id, &script).await?;
        if !result.success() {
            return Err(RemoteError::exec_failed(
                host_id,
                format!("job launch failed: {}", result.stderr_text().trim()),
            ));
        }
        let pid = result.stdout_text().trim().parse::<u32>().map_err(|_| {
            RemoteError::exec_failed(
                host_id,
                format!("job launch returned no pid: {:?}", result.stdout_text()),
            )
        })?;

        let record = JobRecord {
            id: id.clone(),
            host_id: host_id.to_string(),
            command: command.to_string(),
            name: name.map(str::to_string),
            status: JobStatus::Running,
            pid,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            output_path: self.output_path(&id),
        };
        self.table.insert(record.clone())?;
        log::info!("[{host_id}] started job {id} (pid {pid}): {command}");
        Ok(record)
    }

    /// Current record for `id`, probing the remote process if it was
    /// running.
    pub async fn get_status(&self, id: &str) -> Result<JobRecord> {
        let record = self.record(id).await?;
        if !record.status.is_running() {
            return Ok(record);
        }

        let files = self.files(id)?;
        let script = liveness_script(record.pid, &files);
        let result = self.executor.run_checked(&record.host_id, &script).await?;

        match parse_liveness(&result.stdout_text()) {
            Liveness::Running => Ok(record),
            Liveness::Exited(code) => {
                let status = JobStatus::from_exit_code(code);
                log::info!("[{}] job {id} finished with exit {code}", record.host_id);
                self.table
                    .finish(id, status, code)
                    .await?
                    .ok_or_else(|| RemoteError::JobNotFound(id.to_string()))
            }
        }
    }

    /// Captured output, whole or the last `tail` lines.
    ///
    /// Returns [`NO_OUTPUT_PLACEHOLDER`] if the output file does not exist.
    pub async fn get_output(&self, id: &str, tail: Option<usize>) -> Result<String> {
        let record = self.record(id).await?;
        let files = self.files(id)?;
        let read = match tail {
            Some(lines) => format!("tail -n {lines} {}", files.output),
            None => format!("cat {}", files.output),
        };
        let script = format!(
            "[ -f {out} ] || exit {MISSING_OUTPUT_STATUS}\n{read}",
            out = files.output
        );

        let result = self.executor.run(&record.host_id, &script).await?;
        match result.exit_code {
            Some(0) => Ok(result.stdout_text()),
            Some(MISSING_OUTPUT_STATUS) => Ok(NO_OUTPUT_PLACEHOLDER.to_string()),
            _ => Err(RemoteError::exec_failed(
                &record.host_id,
                format!("reading job output failed: {}", result.stderr_text().trim()),
            )),
        }
    }

    /// All jobs, optionally for one host, most recent first.
    ///
    /// Running jobs are re-checked first; a failed check leaves that job's
    /// record as it was.
    pub async fn list(&self, host_id: Option<&str>) -> Result<Vec<JobRecord>> {
        let records = self.table.list().await?;
        let mut jobs = Vec::with_capacity(records.len());

        for record in records {
            if host_id.is_some_and(|h| h != record.host_id) {
                continue;
            }
            if !record.status.is_running() {
                jobs.push(record);
                continue;
            }
            match self.get_status(&record.id).await {
                Ok(refreshed) => jobs.push(refreshed),
                Err(err) => {
                    log::warn!("Could not refresh job {}: {err}", record.id);
                    jobs.push(record);
                }
            }
        }

        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }

    /// Kill a running job.
    ///
    /// Returns `false`, leaving the record alone, if the job had already
    /// finished or the remote kill failed.
    pub async fn kill(&self, id: &str) -> Result<bool> {
        let record = self.record(id).await?;
        if !record.status.is_running() {
            return Ok(false);
        }

        // The wrapper leads its own process group, so one signal reaches
        // everything the command forked. Hosts without setsid fall back to
        // the wrapper and its direct children.
        let script = format!(
            "kill -s KILL -- -{pid} 2>/dev/null || {{ pkill -9 -P {pid} 2>/dev/null; kill -9 {pid}; }}",
            pid = record.pid
        );
        let result = self.executor.run(&record.host_id, &script).await?;
        if !result.success() {
            log::warn!(
                "[{}] kill of job {id} failed: {}",
                record.host_id,
                result.stderr_text().trim()
            );
            return Ok(false);
        }

        let updated = self
            .table
            .finish(id, JobStatus::Failed, KILLED_EXIT_CODE)
            .await?;
        let killed = updated.is_some_and(|job| job.exit_code == Some(KILLED_EXIT_CODE));
        if killed {
            log::info!("[{}] killed job {id}", record.host_id);
        }
        Ok(killed)
    }

    /// Forget a job, removing its remote files on a best-effort basis.
    pub async fn cleanup(&self, id: &str) -> Result<()> {
        let record = self.record(id).await?;
        let files = self.files(id)?;
        let script = format!(
            "rm -f {} {} {} {}",
            files.output, files.pid, files.exit, files.exit_tmp
        );

        match self.executor.run(&record.host_id, &script).await {
            Ok(result) if result.success() => {}
            Ok(result) => log::warn!(
                "[{}] cleanup of job {id} files failed: {}",
                record.host_id,
                result.stderr_text().trim()
            ),
            Err(err) => log::warn!("[{}] cleanup of job {id} files failed: {err}", record.host_id),
        }

        self.table.remove(id).await?;
        Ok(())
    }
}

fn new_job_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("job-{}", &uuid[..8])
}

/// Shell script that detaches `command` and prints the wrapper's pid.
///
/// The wrapper runs the command in its own `sh` so an `exit` inside the
/// command cannot skip recording the status. Where `setsid` exists the
/// wrapper starts a new session, making its pid the process group id that
/// [`JobSupervisor::kill`] signals.
fn launch_script(command: &str, job_dir: &str, files: &JobFiles) -> Result<String> {
    let wrapper = format!(
        "sh -c {cmd}; echo $? > {tmp} && mv {tmp} {exit}",
        cmd = shell::quote(command)?,
        tmp = files.exit_tmp,
        exit = files.exit,
    );
    Ok(format!(
        "mkdir -p {job_dir} || exit 1\n\
         if command -v setsid >/dev/null 2>&1; then\n\
         setsid nohup sh -c {wrapper} > {out} 2>&1 < /dev/null &\n\
         else\n\
         nohup sh -c {wrapper} > {out} 2>&1 < /dev/null &\n\
         fi\n\
         echo $! > {pid}\n\
         cat {pid}",
        wrapper = shell::quote(&wrapper)?,
        out = files.output,
        pid = files.pid,
    ))
}

fn liveness_script(pid: u32, files: &JobFiles) -> String {
    format!(
        "if [ -f {exit} ]; then echo \"exited $(cat {exit})\"\n\
         elif kill -0 {pid} 2>/dev/null; then echo running\n\
         else wait {pid} 2>/dev/null; echo \"gone $?\"; fi",
        exit = files.exit,
    )
}

fn parse_liveness(output: &str) -> Liveness {
    let line = output.trim();
    if let Some(code) = line.strip_prefix("exited") {
        return Liveness::Exited(code.trim().parse().unwrap_or(0));
    }
    if let Some(code) = line.strip_prefix("gone") {
        return match code.trim().parse::<i32>() {
            Ok(code) if code != WAIT_NOT_A_CHILD => Liveness::Exited(code),
            _ => {
                log::warn!("Exit status unavailable for vanished job; assuming success");
                Liveness::Exited(0)
            }
        };
    }
    Liveness::Running
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::tests::local_executor;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn supervisor(hosts: &[&str]) -> (JobSupervisor, TempDir) {
        let dir = tempdir().unwrap();
        let job_dir = dir.path().join("jobs").to_string_lossy().into_owned();
        (JobSupervisor::new(local_executor(hosts), job_dir), dir)
    }

    async fn wait_finished(jobs: &JobSupervisor, id: &str) -> JobRecord {
        for _ in 0..100 {
            let record = jobs.get_status(id).await.unwrap();
            if !record.status.is_running() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {id} never finished");
    }

    #[test]
    fn parse_liveness_variants() {
        assert_eq!(parse_liveness("running\n"), Liveness::Running);
        assert_eq!(parse_liveness("exited 0\n"), Liveness::Exited(0));
        assert_eq!(parse_liveness("exited 2\n"), Liveness::Exited(2));
        assert_eq!(parse_liveness("gone 127\n"), Liveness::Exited(0));
        assert_eq!(parse_liveness("gone 5\n"), Liveness::Exited(5));
        assert_eq!(parse_liveness("gone \n"), Liveness::Exited(0));
        assert_eq!(parse_liveness("gone"), Liveness::Exited(0));
        assert_eq!(parse_liveness("exited\n"), Liveness::Exited(0));
    }

    #[test]
    fn job_ids_are_unique_and_prefixed() {
        let a = new_job_id();
        let b = new_job_id();
        assert!(a.starts_with("job-"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let (jobs, _dir) = supervisor(&["box"]);
        let started = jobs.start("box", "exit 0", Some("noop")).await.unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.name.as_deref(), Some("noop"));
        assert!(started.pid > 0);

        let done = wait_finished(&jobs, &started.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.ended_at.is_some());
    }

    #[tokio::test]
    async fn failing_job_records_exit_code() {
        let (jobs, _dir) = supervisor(&["box"]);
        let started = jobs.start("box", "exit 2", None).await.unwrap();

        let done = wait_finished(&jobs, &started.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.exit_code, Some(2));
    }

    #[tokio::test]
    async fn output_is_captured_and_tailed() {
        let (jobs, _dir) = supervisor(&["box"]);
        let started = jobs
            .start("box", "printf 'a\\nb\\nc\\n'; echo warn >&2", None)
            .await
            .unwrap();
        wait_finished(&jobs, &started.id).await;

        let full = jobs.get_output(&started.id, None).await.unwrap();
        assert!(full.contains("a\nb\nc\n"));
        assert!(full.contains("warn"));

        let tail = jobs.get_output(&started.id, Some(1)).await.unwrap();
        assert_eq!(tail.lines().count(), 1);
    }

    #[tokio::test]
    async fn missing_output_returns_placeholder() {
        let (jobs, _dir) = supervisor(&["box"]);
        jobs.table
            .insert(JobRecord {
                id: "job-ghost".to_string(),
                host_id: "box".to_string(),
                command: "true".to_string(),
                name: None,
                status: JobStatus::Completed,
                pid: 1,
                started_at: Utc::now(),
                ended_at: Some(Utc::now()),
                exit_code: Some(0),
                output_path: jobs.output_path("job-ghost"),
            })
            .unwrap();

        let output = jobs.get_output("job-ghost", None).await.unwrap();
        assert_eq!(output, NO_OUTPUT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn kill_running_job() {
        let (jobs, _dir) = supervisor(&["box"]);
        let started = jobs.start("box", "sleep 30", None).await.unwrap();

        assert!(jobs.kill(&started.id).await.unwrap());
        let record = jobs.get_status(&started.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.exit_code, Some(KILLED_EXIT_CODE));

        assert!(!jobs.kill(&started.id).await.unwrap());
    }

    #[tokio::test]
    async fn kill_reaches_grandchildren() {
        let (jobs, _dir) = supervisor(&["box"]);
        let started = jobs
            .start("box", "sleep 37.25; echo after", None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(jobs.kill(&started.id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let survivors = jobs
            .executor
            .run("box", "ps -eo args= | grep -c '^sleep 37\\.25$'")
            .await
            .unwrap();
        assert_eq!(survivors.stdout_text().trim(), "0");
    }

    #[tokio::test]
    async fn kill_finished_job_is_noop() {
        let (jobs, _dir) = supervisor(&["box"]);
        let started = jobs.start("box", "exit 0", None).await.unwrap();
        wait_finished(&jobs, &started.id).await;

        assert!(!jobs.kill(&started.id).await.unwrap());
        let record = jobs.get_status(&started.id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let (jobs, _dir) = supervisor(&["a", "b"]);
        let first = jobs.start("a", "exit 0", None).await.unwrap();
        let second = jobs.start("b", "exit 0", None).await.unwrap();
        let third = jobs.start("a", "sleep 30", None).await.unwrap();

        let all = jobs.list(None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), second.id.as_str(), first.id.as_str()]);

        let on_a = jobs.list(Some("a")).await.unwrap();
        assert_eq!(on_a.len(), 2);
        assert!(on_a.iter().all(|j| j.host_id == "a"));

        assert!(jobs.list(Some("missing")).await.unwrap().is_empty());

        jobs.kill(&third.id).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_forgets_job_and_files() {
        let (jobs, dir) = supervisor(&["box"]);
        let started = jobs.start("box", "echo bye", None).await.unwrap();
        wait_finished(&jobs, &started.id).await;

        let out_file = dir.path().join("jobs").join(format!("{}.out", started.id));
        assert!(out_file.exists());

        jobs.cleanup(&started.id).await.unwrap();
        assert!(!out_file.exists());
        assert!(matches!(
            jobs.get_status(&started.id).await.unwrap_err(),
            RemoteError::JobNotFound(_)
        ));
    }

    #[tokio::test]
    async fn unknown_job_ids_fail() {
        let (jobs, _dir) = supervisor(&["box"]);
        assert!(matches!(jobs.get_status("job-nope").await, Err(RemoteError::JobNotFound(_))));
        assert!(matches!(jobs.kill("job-nope").await, Err(RemoteError::JobNotFound(_))));
        assert!(matches!(jobs.get_output("job-nope", None).await, Err(RemoteError::JobNotFound(_))));
        assert!(matches!(jobs.cleanup("job-nope").await, Err(RemoteError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn start_on_unknown_host_fails() {
        let (jobs, _dir) = supervisor(&["box"]);
        let err = jobs.start("nowhere", "true", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::UnknownHost(_)));
    }
}
