//! Versioned backups of remote paths.
//!
//! # Variants
//!
//! | Kind      | Taken when                          | Restore                          |
//! |-----------|-------------------------------------|----------------------------------|
//! | `git`     | path is inside a git working tree   | `git checkout <commit> -- .`     |
//! | `archive` | any other path                      | untar into the parent directory  |
//! | `file`    | a file is about to be overwritten   | copy the backup over the file    |
//!
//! Archives and file backups live on the remote host under
//! `snapshots.remoteDir`. Git snapshots are ordinary commits in the
//! working tree itself.
//!
//! # Log
//!
//! Metadata goes to a local append-only log (see [`SnapshotLog`]). Cleanup
//! deletes remote artifacts and appends removal markers; the log is never
//! compacted.

mod journal;
pub mod retention;
mod types;

pub use journal::SnapshotLog;
pub use types::{LogEntry, RemovalMarker, SnapshotKind, SnapshotRecord};

use chrono::Utc;
use std::sync::Arc;

use crate::config::SnapshotSettings;
use crate::error::{RemoteError, Result};
use crate::exec::CommandExecutor;
use crate::paths;
use crate::shell;

/// How many of the newest records `restore` searches.
pub const RESTORE_SCAN_LIMIT: usize = 1000;

/// Exit status the file-backup script uses when the target does not exist.
const NO_SUCH_FILE_STATUS: i32 = 3;

const GIT_IDENTITY: &str =
    "-c user.name=outpost -c user.email=outpost@localhost -c commit.gpgsign=false";

pub struct SnapshotStore {
    executor: Arc<CommandExecutor>,
    log: SnapshotLog,
    settings: SnapshotSettings,
}

impl SnapshotStore {
    /// Create a store, resolving a `~/` log path against the local home.
    pub fn new(executor: Arc<CommandExecutor>, settings: SnapshotSettings) -> Result<Self> {
        let log = SnapshotLog::new(paths::expand_home(&settings.log_path)?);
        Ok(Self {
            executor,
            log,
            settings,
        })
    }

    pub fn log(&self) -> &SnapshotLog {
        &self.log
    }

    fn remote_dir(&self) -> &str {
        shell::normalize_path(&self.settings.remote_dir)
    }

    /// Snapshot `path` on `host_id`.
    ///
    /// Git working trees get a commit of all current changes; anything else
    /// is archived.
    pub async fn create(&self, host_id: &str, path: &str) -> Result<SnapshotRecord> {
        let id = new_snapshot_id();
        let kind = if self.is_git_worktree(host_id, path).await? {
            self.commit(host_id, path, &id).await?
        } else {
            self.archive(host_id, path, &id).await?
        };

        let record = SnapshotRecord {
            id,
            timestamp: Utc::now(),
            host_id: host_id.to_string(),
            path: path.to_string(),
            kind,
        };
        self.log.append(&record)?;
        log::info!(
            "[{host_id}] {} snapshot {} of {path}",
            record.kind.label(),
            record.id
        );
        Ok(record)
    }

    async fn is_git_worktree(&self, host_id: &str, path: &str) -> Result<bool> {
        let command = format!(
            "git -C {} rev-parse --is-inside-work-tree 2>/dev/null",
            shell::remote_path(path)?
        );
        let result = self.executor.run(host_id, &command).await?;
        Ok(result.success() && result.stdout_text().trim() == "true")
    }

    async fn commit(&self, host_id: &str, path: &str, id: &str) -> Result<SnapshotKind> {
        let dir = shell::remote_path(path)?;
        let message = shell::quote(&format!("outpost snapshot {id}"))?;
        let command = format!(
            "git -C {dir} add -A && \
             git -C {dir} {GIT_IDENTITY} commit -q --allow-empty -m {message} && \
             git -C {dir} rev-parse HEAD"
        );
        let result = self.executor.run_checked(host_id, &command).await?;
        let commit = result
            .stdout_text()
            .lines()
            .last()
            .map(|line| line.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RemoteError::exec_failed(host_id, "git did not report a commit"))?;
        Ok(SnapshotKind::Git { commit })
    }

    async fn archive(&self, host_id: &str, path: &str, id: &str) -> Result<SnapshotKind> {
        let (parent, name) = shell::split_path(path);
        let archive_path = format!(
            "{}/{}-{}-{}.tar.gz",
            self.remote_dir(),
            name,
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            id
        );
        let command = format!(
            "mkdir -p {dir} && tar -czf {archive} -C {parent} {name}",
            dir = shell::remote_path(self.remote_dir())?,
            archive = shell::remote_path(&archive_path)?,
            parent = shell::remote_path(&parent)?,
            name = shell::quote(&name)?,
        );
        self.executor.run_checked(host_id, &command).await?;
        Ok(SnapshotKind::Archive { archive_path })
    }

    /// Back up `remote_path` before it gets overwritten.
    ///
    /// Returns `None` without touching the host when auto-snapshots are
    /// disabled, and `None` when the file does not exist yet.
    pub async fn create_file_snapshot(
        &self,
        host_id: &str,
        remote_path: &str,
    ) -> Result<Option<SnapshotRecord>> {
        if !self.settings.auto_snapshot_on_upload {
            return Ok(None);
        }

        let id = new_snapshot_id();
        let (_, name) = shell::split_path(remote_path);
        let backup_path = format!(
            "{}/{}-{}-{}.bak",
            self.remote_dir(),
            name,
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            id
        );
        let target = shell::remote_path(remote_path)?;
        let command = format!(
            "[ -f {target} ] || exit {NO_SUCH_FILE_STATUS}\n\
             mkdir -p {dir} && cp -p {target} {backup}",
            dir = shell::remote_path(self.remote_dir())?,
            backup = shell::remote_path(&backup_path)?,
        );

        let result = self.executor.run(host_id, &command).await?;
        match result.exit_code {
            Some(0) => {}
            Some(NO_SUCH_FILE_STATUS) => return Ok(None),
            _ => {
                return Err(RemoteError::exec_failed(
                    host_id,
                    format!("file backup failed: {}", result.stderr_text().trim()),
                ))
            }
        }

        let record = SnapshotRecord {
            id,
            timestamp: Utc::now(),
            host_id: host_id.to_string(),
            path: remote_path.to_string(),
            kind: SnapshotKind::File { backup_path },
        };
        self.log.append(&record)?;
        log::info!("[{host_id}] file snapshot {} of {remote_path}", record.id);
        Ok(Some(record))
    }

    /// Live snapshots, newest first, optionally for one host.
    pub fn list(&self, host_id: Option<&str>, limit: usize) -> Result<Vec<SnapshotRecord>> {
        let mut records = self.log.records()?;
        if let Some(host_id) = host_id {
            records.retain(|r| r.host_id == host_id);
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    /// Put the snapshotted path back to its recorded state.
    ///
    /// Returns a one-line summary of what was done.
    pub async fn restore(&self, id: &str) -> Result<String> {
        let record = self.log.find(id, RESTORE_SCAN_LIMIT)?;
        if record.kind.reference().trim().is_empty() {
            return Err(RemoteError::CorruptRecord {
                id: id.to_string(),
                message: format!("empty {} reference", record.kind.label()),
            });
        }

        let host_id = record.host_id.as_str();
        let target = shell::remote_path(&record.path)?;
        let summary = match &record.kind {
            SnapshotKind::Git { commit } => {
                let command = format!(
                    "git -C {target} checkout -q {} -- .",
                    shell::quote(commit)?
                );
                self.executor.run_checked(host_id, &command).await?;
                format!("Restored {} to commit {commit}", record.path)
            }
            SnapshotKind::Archive { archive_path } => {
                let (parent, _) = shell::split_path(&record.path);
                let command = format!(
                    "tar -xzf {} -C {}",
                    shell::remote_path(archive_path)?,
                    shell::remote_path(&parent)?
                );
                self.executor.run_checked(host_id, &command).await?;
                format!("Restored {} from archive {archive_path}", record.path)
            }
            SnapshotKind::File { backup_path } => {
                let command = format!("cp -p {} {target}", shell::remote_path(backup_path)?);
                self.executor.run_checked(host_id, &command).await?;
                format!("Restored {} from backup {backup_path}", record.path)
            }
        };

        log::info!("[{host_id}] restored snapshot {id}");
        Ok(summary)
    }

    /// Apply the retention policy, returning how many snapshots were removed.
    ///
    /// Remote artifact deletion is best-effort; a record whose artifact
    /// could not be deleted is still marked removed.
    pub async fn cleanup(&self, host_id: Option<&str>) -> Result<usize> {
        let mut records = self.log.records()?;
        if let Some(host_id) = host_id {
            records.retain(|r| r.host_id == host_id);
        }
        let expired = retention::select_expired(&records, &self.settings.retention, Utc::now());

        for record in &expired {
            let Some(artifact) = record.kind.artifact() else {
                continue;
            };
            if let Err(err) = self.delete_artifact(&record.host_id, artifact).await {
                log::warn!(
                    "[{}] could not delete snapshot artifact {artifact}: {err}",
                    record.host_id
                );
            }
        }

        let ids: Vec<String> = expired.iter().map(|r| r.id.clone()).collect();
        self.log.mark_removed(&ids)?;
        if !ids.is_empty() {
            log::info!("Removed {} expired snapshot(s)", ids.len());
        }
        Ok(ids.len())
    }

    async fn delete_artifact(&self, host_id: &str, artifact: &str) -> Result<()> {
        let command = format!("rm -f {}", shell::remote_path(artifact)?);
        self.executor.run_checked(host_id, &command).await?;
        Ok(())
    }
}

fn new_snapshot_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("snap-{}", &uuid[..12])
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionPolicy;
    use crate::exec::tests::local_executor;
    use chrono::Duration;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn settings(root: &Path) -> SnapshotSettings {
        SnapshotSettings {
            log_path: root.join("snapshots.jsonl").to_string_lossy().into_owned(),
            remote_dir: root.join("backups").to_string_lossy().into_owned(),
            auto_snapshot_on_upload: true,
            retention: RetentionPolicy::default(),
        }
    }

    fn store(hosts: &[&str]) -> (SnapshotStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(local_executor(hosts), settings(dir.path())).unwrap();
        (store, dir)
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn archive_round_trip() {
        let (store, dir) = store(&["box"]);
        let app = dir.path().join("app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("config.txt"), "one").unwrap();

        let record = store.create("box", &path_str(&app)).await.unwrap();
        assert_eq!(store.list(None, 1).unwrap()[0].id, record.id);
        let SnapshotKind::Archive { archive_path } = &record.kind else {
            panic!("expected archive snapshot, got {:?}", record.kind);
        };
        assert!(Path::new(archive_path).exists());

        fs::write(app.join("config.txt"), "two").unwrap();
        let summary = store.restore(&record.id).await.unwrap();
        assert!(summary.contains("archive"));
        assert_eq!(fs::read_to_string(app.join("config.txt")).unwrap(), "one");
    }

    #[tokio::test]
    async fn git_round_trip() {
        if !git_available() {
            eprintln!("git not available; skipping");
            return;
        }
        let (store, dir) = store(&["box"]);
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("main.rs"), "fn main() {}").unwrap();
        store
            .executor
            .run_checked("box", &format!("git init -q {}", shell::quote(&path_str(&repo)).unwrap()))
            .await
            .unwrap();

        let record = store.create("box", &path_str(&repo)).await.unwrap();
        assert_eq!(store.list(None, 1).unwrap()[0].id, record.id);
        let SnapshotKind::Git { commit } = &record.kind else {
            panic!("expected git snapshot, got {:?}", record.kind);
        };
        assert_eq!(commit.len(), 40);

        fs::write(repo.join("main.rs"), "broken").unwrap();
        let summary = store.restore(&record.id).await.unwrap();
        assert!(summary.contains(commit.as_str()));
        assert_eq!(fs::read_to_string(repo.join("main.rs")).unwrap(), "fn main() {}");
    }

    #[tokio::test]
    async fn create_on_missing_path_fails() {
        let (store, dir) = store(&["box"]);
        let missing = dir.path().join("nope");
        let err = store.create("box", &path_str(&missing)).await.unwrap_err();
        assert!(matches!(err, RemoteError::ExecFailed { .. }));
        assert!(store.list(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_snapshot_round_trip() {
        let (store, dir) = store(&["box"]);
        let file = dir.path().join("nginx.conf");
        fs::write(&file, "original").unwrap();

        let record = store
            .create_file_snapshot("box", &path_str(&file))
            .await
            .unwrap()
            .expect("file exists");
        assert_eq!(record.kind.label(), "file");

        fs::write(&file, "uploaded").unwrap();
        store.restore(&record.id).await.unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "original");
    }

    #[tokio::test]
    async fn file_snapshot_skips_missing_file() {
        let (store, dir) = store(&["box"]);
        let missing = dir.path().join("new.conf");
        assert!(store
            .create_file_snapshot("box", &path_str(&missing))
            .await
            .unwrap()
            .is_none());
        assert!(store.list(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_snapshot_disabled_by_setting() {
        let dir = tempdir().unwrap();
        let mut cfg = settings(dir.path());
        cfg.auto_snapshot_on_upload = false;
        let store = SnapshotStore::new(local_executor(&["box"]), cfg).unwrap();

        let file = dir.path().join("app.conf");
        fs::write(&file, "x").unwrap();
        assert!(store
            .create_file_snapshot("box", &path_str(&file))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_puts_newest_first_and_filters_hosts() {
        let (store, dir) = store(&["a", "b"]);
        let file = dir.path().join("f.txt");
        fs::write(&file, "x").unwrap();
        let path = path_str(&file);

        let first = store.create_file_snapshot("a", &path).await.unwrap().unwrap();
        let second = store.create_file_snapshot("b", &path).await.unwrap().unwrap();
        let third = store.create_file_snapshot("a", &path).await.unwrap().unwrap();

        let all = store.list(None, 10).unwrap();
        assert_eq!(all[0].id, third.id);
        assert_eq!(all.len(), 3);

        let on_a: Vec<String> = store.list(Some("a"), 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(on_a, vec![third.id.clone(), first.id.clone()]);

        assert_eq!(store.list(None, 1).unwrap().len(), 1);
        assert!(store.list(Some("missing"), 10).unwrap().is_empty());
        assert!(store.list(None, 10).unwrap().iter().any(|r| r.id == second.id));
    }

    #[tokio::test]
    async fn restore_unknown_id_is_not_found() {
        let (store, _dir) = store(&["box"]);
        assert!(matches!(
            store.restore("snap-missing").await,
            Err(RemoteError::SnapshotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_empty_reference_is_corrupt() {
        let (store, _dir) = store(&["box"]);
        store
            .log
            .append(&SnapshotRecord {
                id: "snap-empty".to_string(),
                timestamp: Utc::now(),
                host_id: "box".to_string(),
                path: "/srv".to_string(),
                kind: SnapshotKind::Git {
                    commit: String::new(),
                },
            })
            .unwrap();
        assert!(matches!(
            store.restore("snap-empty").await,
            Err(RemoteError::CorruptRecord { .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_expired_artifacts_and_hides_records() {
        let dir = tempdir().unwrap();
        let mut cfg = settings(dir.path());
        cfg.retention = RetentionPolicy {
            max_age_days: 7,
            keep_min_count: 1,
            ..RetentionPolicy::default()
        };
        let store = SnapshotStore::new(local_executor(&["box"]), cfg).unwrap();

        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let mut artifacts = Vec::new();
        for (i, days) in [0i64, 10, 20].iter().enumerate() {
            let artifact = backups.join(format!("f-{i}.bak"));
            fs::write(&artifact, "x").unwrap();
            store
                .log
                .append(&SnapshotRecord {
                    id: format!("snap-{i}"),
                    timestamp: Utc::now() - Duration::days(*days),
                    host_id: "box".to_string(),
                    path: "/etc/f".to_string(),
                    kind: SnapshotKind::File {
                        backup_path: path_str(&artifact),
                    },
                })
                .unwrap();
            artifacts.push(artifact);
        }

        assert_eq!(store.cleanup(Some("box")).await.unwrap(), 2);
        assert!(artifacts[0].exists());
        assert!(!artifacts[1].exists());
        assert!(!artifacts[2].exists());

        let ids: Vec<String> = store.list(None, 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["snap-0"]);
        assert!(matches!(
            store.restore("snap-2").await,
            Err(RemoteError::SnapshotNotFound(_))
        ));

        assert_eq!(store.cleanup(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_swallows_artifact_failures() {
        let dir = tempdir().unwrap();
        let mut cfg = settings(dir.path());
        cfg.retention.keep_min_count = 0;
        let store = SnapshotStore::new(local_executor(&["box"]), cfg).unwrap();

        // Host no longer configured: deletion fails, record still removed.
        store
            .log
            .append(&SnapshotRecord {
                id: "snap-gone".to_string(),
                timestamp: Utc::now() - Duration::days(30),
                host_id: "decommissioned".to_string(),
                path: "/srv".to_string(),
                kind: SnapshotKind::Archive {
                    archive_path: "/tmp/never.tar.gz".to_string(),
                },
            })
            .unwrap();

        assert_eq!(store.cleanup(None).await.unwrap(), 1);
        assert!(store.list(None, 10).unwrap().is_empty());
    }
}
