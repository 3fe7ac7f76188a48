//! Local shell transport.
//!
//! Runs commands through `/bin/sh -c` on this machine. Used for hosts
//! configured with `"transport": "local"` and throughout the test suite.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;

use super::{pump_child, ChunkSender, Connector, RemoteSession};
use crate::config::HostConfig;
use crate::error::{RemoteError, Result};

pub struct LocalConnector {
    shell: String,
}

impl LocalConnector {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, host_id: &str, _host: &HostConfig) -> Result<Arc<dyn RemoteSession>> {
        log::debug!("Opening local shell session for {host_id}");
        Ok(Arc::new(LocalSession {
            host_id: host_id.to_string(),
            shell: self.shell.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalSession {
    host_id: String,
    shell: String,
    closed: AtomicBool,
}

#[async_trait]
impl RemoteSession for LocalSession {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str, output: ChunkSender) -> Result<Option<i32>> {
        if !self.is_ready() {
            return Err(RemoteError::stream(&self.host_id, "session is closed"));
        }

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::exec_failed(&self.host_id, format!("spawn failed: {e}")))?;

        let status = pump_child(&self.host_id, child, &output).await?;
        Ok(status.code())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use tokio::sync::mpsc;

    fn host() -> HostConfig {
        HostConfig {
            host: "localhost".to_string(),
            port: 22,
            username: "tester".to_string(),
            identity_file: None,
            transport: TransportKind::Local,
        }
    }

    #[tokio::test]
    async fn closed_session_refuses_commands() {
        let session = LocalConnector::default().connect("l", &host()).await.unwrap();
        session.close().await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = session.exec("true", tx).await.unwrap_err();
        assert!(matches!(err, RemoteError::StreamError { .. }));
    }

    #[tokio::test]
    async fn missing_shell_is_exec_failure() {
        let connector = LocalConnector::new("/nonexistent/shell");
        let session = connector.connect("l", &host()).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = session.exec("true", tx).await.unwrap_err();
        assert!(matches!(err, RemoteError::ExecFailed { .. }));
    }

    #[tokio::test]
    async fn signal_death_has_no_exit_code() {
        let session = LocalConnector::default().connect("l", &host()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let code = session.exec("kill -9 $$", tx).await.unwrap();
        assert_eq!(code, None);
    }
}
