//! OutpostContext - everything one server process shares.
//!
//! ```text
//!              ┌──────────────────────────┐
//!              │      OutpostContext      │
//!              ├──────────────────────────┤
//!              │  - OutpostConfig         │
//!              │  - ConnectionPool        │
//!              │  - CommandExecutor       │
//!              │  - JobSupervisor         │
//!              │  - SnapshotStore         │
//!              │  - AuditSink             │
//!              └────────────┬─────────────┘
//!                           │
//!                           ▼
//!                  ┌─────────────────┐
//!                  │  outpost-daemon │
//!                  └─────────────────┘
//! ```
//!
//! Cloning the context clones the `Arc`s, not the state.

use std::sync::Arc;

use crate::audit::{AuditSink, JsonlAuditLog};
use crate::config::OutpostConfig;
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::jobs::JobSupervisor;
use crate::paths;
use crate::pool::ConnectionPool;
use crate::snapshot::SnapshotStore;
use crate::transport::{Connector, DefaultConnector};

#[derive(Default)]
pub struct OutpostContextBuilder {
    config: Option<OutpostConfig>,
    connector: Option<Arc<dyn Connector>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl OutpostContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: OutpostConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom connector (tests, alternative transports).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom audit sink instead of the JSONL files.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Build the context. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if a `~/` path in the configuration cannot be resolved.
    pub fn build(self) -> Result<OutpostContext> {
        let config = self.config.unwrap_or_default();
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(DefaultConnector::default()));
        let audit = match self.audit {
            Some(audit) => audit,
            None => Arc::new(JsonlAuditLog::new(paths::expand_home(&config.audit.dir)?)),
        };

        let pool = Arc::new(ConnectionPool::from_config(&config, connector));
        let executor = Arc::new(CommandExecutor::new(Arc::clone(&pool)));
        let jobs = Arc::new(JobSupervisor::new(Arc::clone(&executor), config.job_dir.clone()));
        let snapshots = Arc::new(SnapshotStore::new(
            Arc::clone(&executor),
            config.snapshots.clone(),
        )?);

        Ok(OutpostContext {
            config: Arc::new(config),
            pool,
            executor,
            jobs,
            snapshots,
            audit,
        })
    }
}

#[derive(Clone)]
pub struct OutpostContext {
    pub config: Arc<OutpostConfig>,
    pub pool: Arc<ConnectionPool>,
    pub executor: Arc<CommandExecutor>,
    pub jobs: Arc<JobSupervisor>,
    pub snapshots: Arc<SnapshotStore>,
    pub audit: Arc<dyn AuditSink>,
}

impl OutpostContext {
    pub fn builder() -> OutpostContextBuilder {
        OutpostContextBuilder::new()
    }

    /// Start background maintenance (the idle sweep).
    pub fn start(&self) {
        self.pool.start_eviction();
    }

    /// Close every session and stop background tasks.
    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRecord;
    use crate::config::{HostConfig, TransportKind};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MemoryAudit(Mutex<Vec<AuditRecord>>);

    impl AuditSink for MemoryAudit {
        fn record(&self, record: &AuditRecord) -> Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn local_config(root: &std::path::Path) -> OutpostConfig {
        let mut config = OutpostConfig::default();
        config.hosts.insert(
            "box".to_string(),
            HostConfig {
                host: "localhost".to_string(),
                port: 22,
                username: "tester".to_string(),
                identity_file: None,
                transport: TransportKind::Local,
            },
        );
        config.job_dir = root.join("jobs").to_string_lossy().into_owned();
        config.snapshots.log_path = root.join("snapshots.jsonl").to_string_lossy().into_owned();
        config.snapshots.remote_dir = root.join("backups").to_string_lossy().into_owned();
        config.audit.dir = root.join("audit").to_string_lossy().into_owned();
        config
    }

    #[tokio::test]
    async fn builds_working_context_from_config() {
        let dir = tempdir().unwrap();
        let ctx = OutpostContext::builder()
            .config(local_config(dir.path()))
            .build()
            .unwrap();
        ctx.start();

        let result = ctx.executor.run("box", "echo hi").await.unwrap();
        assert_eq!(result.stdout_text(), "hi\n");
        assert!(ctx.pool.is_connected("box"));
        assert_eq!(ctx.pool.host_ids(), vec!["box".to_string()]);

        ctx.shutdown().await;
        assert!(!ctx.pool.is_connected("box"));
    }

    #[tokio::test]
    async fn custom_audit_sink_is_used() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(MemoryAudit::default());
        let ctx = OutpostContext::builder()
            .config(local_config(dir.path()))
            .audit(sink.clone())
            .build()
            .unwrap();

        let result = ctx.executor.run("box", "true").await.unwrap();
        ctx.audit
            .record(&AuditRecord::from_execution("box", "tester", "true", &result))
            .unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let dir = tempdir().unwrap();
        let ctx = OutpostContext::builder()
            .config(local_config(dir.path()))
            .build()
            .unwrap();
        let clone = ctx.clone();

        let job = ctx.jobs.start("box", "true", None).await.unwrap();
        assert!(clone.jobs.get_status(&job.id).await.is_ok());
    }
}
