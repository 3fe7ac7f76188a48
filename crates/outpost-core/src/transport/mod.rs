//! Remote session transports.
//!
//! # Overview
//!
//! A [`RemoteSession`] is one authenticated, multiplexable channel to a host.
//! The [`crate::pool::ConnectionPool`] owns sessions; nothing else holds them
//! long term. Sessions are created by a [`Connector`].
//!
//! # OpenSSH
//!
//! SSH goes through the system `ssh` binary, so `~/.ssh/config`, the agent,
//! known hosts and jump hosts apply as usual. One ControlMaster process per
//! host is the persistent channel; each command is a client on the master
//! socket.
//!
//! # Implementations
//!
//! - [`openssh::OpenSshConnector`] - ControlMaster sessions over `ssh`
//! - [`local::LocalConnector`] - `/bin/sh` on this machine
//! - [`DefaultConnector`] - picks one of the above from [`HostConfig::transport`]

pub mod local;
pub mod openssh;

use async_trait::async_trait;
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::config::{HostConfig, TransportKind};
use crate::error::{RemoteError, Result};

pub use local::LocalConnector;
pub use openssh::OpenSshConnector;

const READ_BUFFER_SIZE: usize = 8192;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A piece of command output, delivered in arrival order.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

pub type ChunkSender = mpsc::UnboundedSender<OutputChunk>;

/// One live channel to a host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host_id(&self) -> &str;

    /// Whether the underlying transport can still carry commands.
    fn is_ready(&self) -> bool;

    /// Run `command` to completion, forwarding output chunks as they arrive.
    ///
    /// Returns the exit code, or `None` when the process was killed by a
    /// signal. A non-zero exit code is not an error.
    async fn exec(&self, command: &str, output: ChunkSender) -> Result<Option<i32>>;

    async fn close(&self);
}

/// Establishes sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host_id: &str, host: &HostConfig) -> Result<Arc<dyn RemoteSession>>;
}

/// Routes each host to the transport named in its configuration.
#[derive(Default)]
pub struct DefaultConnector {
    ssh: OpenSshConnector,
    local: LocalConnector,
}

impl DefaultConnector {
    pub fn new(ssh: OpenSshConnector, local: LocalConnector) -> Self {
        Self { ssh, local }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, host_id: &str, host: &HostConfig) -> Result<Arc<dyn RemoteSession>> {
        match host.transport {
            TransportKind::Ssh => self.ssh.connect(host_id, host).await,
            TransportKind::Local => self.local.connect(host_id, host).await,
        }
    }
}

// ============================================================================
// PROCESS PLUMBING
// ============================================================================

/// Forward a child's stdout and stderr into `output` and wait for it to exit.
///
/// Both pipes are drained concurrently so neither can stall the other.
pub(crate) async fn pump_child(
    host_id: &str,
    mut child: Child,
    output: &ChunkSender,
) -> Result<ExitStatus> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RemoteError::exec_failed(host_id, "stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RemoteError::exec_failed(host_id, "stderr was not captured"))?;

    let (out_res, err_res) = tokio::join!(
        forward(stdout, StreamKind::Stdout, output),
        forward(stderr, StreamKind::Stderr, output),
    );

    let status = child
        .wait()
        .await
        .map_err(|e| RemoteError::stream(host_id, format!("wait failed: {e}")))?;

    out_res.map_err(|e| RemoteError::stream(host_id, format!("stdout read failed: {e}")))?;
    err_res.map_err(|e| RemoteError::stream(host_id, format!("stderr read failed: {e}")))?;

    Ok(status)
}

async fn forward<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: StreamKind,
    output: &ChunkSender,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // The receiver going away only means nobody is listening anymore;
        // keep draining so the child never blocks on a full pipe.
        let _ = output.send(OutputChunk {
            stream,
            data: buf[..n].to_vec(),
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
