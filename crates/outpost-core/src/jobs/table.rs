//! In-memory job table owned by a single actor task.
//!
//! Every read and write goes through the actor's channel, so updates for a
//! job are applied one at a time in the order they were sent. Remote I/O
//! never happens inside the actor; callers check liveness first and then send the
//! mutation.

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

use super::types::{JobRecord, JobStatus};
use crate::error::{RemoteError, Result};

enum TableCommand {
    Insert(JobRecord),
    Get {
        id: String,
        reply: oneshot::Sender<Option<JobRecord>>,
    },
    Finish {
        id: String,
        status: JobStatus,
        exit_code: i32,
        reply: oneshot::Sender<Option<JobRecord>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Option<JobRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<JobRecord>>,
    },
}

/// Handle to the job table actor. Cheap to clone.
#[derive(Clone)]
pub struct JobTable {
    tx: mpsc::UnboundedSender<TableCommand>,
}

impl JobTable {
    /// Spawn the actor on the current tokio runtime.
    ///
    /// The actor stops once every handle has been dropped.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut jobs: HashMap<String, JobRecord> = HashMap::new();
            while let Some(command) = rx.recv().await {
                match command {
                    TableCommand::Insert(record) => {
                        jobs.insert(record.id.clone(), record);
                    }
                    TableCommand::Get { id, reply } => {
                        let _ = reply.send(jobs.get(&id).cloned());
                    }
                    TableCommand::Finish {
                        id,
                        status,
                        exit_code,
                        reply,
                    } => {
                        let record = jobs.get_mut(&id).map(|job| {
                            job.finish(status, exit_code, Utc::now());
                            job.clone()
                        });
                        let _ = reply.send(record);
                    }
                    TableCommand::Remove { id, reply } => {
                        let _ = reply.send(jobs.remove(&id));
                    }
                    TableCommand::List { reply } => {
                        let _ = reply.send(jobs.values().cloned().collect());
                    }
                }
            }
            log::debug!("Job table closed");
        });
        Self { tx }
    }

    fn send(&self, command: TableCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| RemoteError::Shutdown("job table"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> TableCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| RemoteError::Shutdown("job table"))
    }

    pub fn insert(&self, record: JobRecord) -> Result<()> {
        self.send(TableCommand::Insert(record))
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.request(|reply| TableCommand::Get { id, reply }).await
    }

    /// Apply a terminal status if the job is still running.
    ///
    /// Returns the record as stored afterwards, or `None` if it is unknown.
    pub async fn finish(
        &self,
        id: &str,
        status: JobStatus,
        exit_code: i32,
    ) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.request(|reply| TableCommand::Finish {
            id,
            status,
            exit_code,
            reply,
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.request(|reply| TableCommand::Remove { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        self.request(|reply| TableCommand::List { reply }).await
    }
}
