//! # outpost-core
//!
//! Remote host control for automated callers: pooled SSH sessions, command
//! execution with live output, detached job supervision and snapshot/rollback
//! of remote paths.
//!
//! This crate is transport-agnostic and can be used by:
//! - the `outpost-daemon` JSON-lines server
//! - any embedding that wants to drive hosts directly
//!
//! ## Key Concepts
//!
//! - **Session**: one authenticated, reusable channel to a host, owned by the pool
//! - **Detached job**: a remote process that outlives the command that started it
//! - **Snapshot**: a git commit, archive or file copy that a path can be restored from
//! - **Hang alert**: advisory signal that a running command went silent

pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod jobs;
pub mod monitor;
pub mod paths;
pub mod pool;
pub mod shell;
pub mod snapshot;
pub mod transport;
pub mod watchdog;

// Re-export commonly used types
pub use audit::{AuditRecord, AuditSink, JsonlAuditLog};
pub use config::{HostConfig, OutpostConfig, RetentionPolicy, TransportKind};
pub use context::{OutpostContext, OutpostContextBuilder};
pub use error::{RemoteError, Result};
pub use exec::{CommandExecutor, ExecutionResult};
pub use jobs::{JobRecord, JobStatus, JobSupervisor};
pub use monitor::{run_monitored, MonitoredExecution, PromptClassifier};
pub use pool::ConnectionPool;
pub use snapshot::{SnapshotKind, SnapshotRecord, SnapshotStore};
pub use watchdog::{HangAlert, HangWatchdog};
