//! OpenSSH ControlMaster transport.
//!
//! # Session Model
//!
//! Connecting starts a background master process:
//!
//! ```text
//! ssh -M -N -S <socket> -o ControlPersist=no [auth options] user@host
//! ```
//!
//! The session is ready once `ssh -S <socket> -O check` succeeds. Commands
//! then run as short-lived clients on the socket, so authentication happens
//! exactly once per session. Closing sends `-O exit` and kills the master.
//!
//! # Failure Detection
//!
//! ssh reports its own failures with exit status 255. A 255 while the master
//! is dead is treated as a broken stream and the session stops reporting
//! ready; the pool reconnects on next use. A 255 with a healthy master is
//! the remote command's own exit code.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use super::{pump_child, ChunkSender, Connector, RemoteSession};
use crate::config::HostConfig;
use crate::error::{RemoteError, Result};
use crate::{paths, shell};

const SSH_FAILURE_STATUS: i32 = 255;
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct OpenSshConnector {
    ssh_program: String,
    socket_dir: PathBuf,
}

impl OpenSshConnector {
    pub fn new(ssh_program: impl Into<String>, socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            socket_dir: socket_dir.into(),
        }
    }
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self::new("ssh", std::env::temp_dir())
    }
}

/// Options shared by the master and every client invocation.
pub fn base_args(host: &HostConfig) -> Result<Vec<String>> {
    let mut args = vec![
        "-p".to_string(),
        host.port.to_string(),
        "-l".to_string(),
        host.username.clone(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ];
    if let Some(identity) = &host.identity_file {
        let path = paths::expand_home(identity)?;
        args.push("-i".to_string());
        args.push(path.to_string_lossy().into_owned());
        args.push("-o".to_string());
        args.push("IdentitiesOnly=yes".to_string());
    }
    Ok(args)
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, host_id: &str, host: &HostConfig) -> Result<Arc<dyn RemoteSession>> {
        let args = base_args(host)?;
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let socket = self.socket_dir.join(format!("outpost-{}.sock", &short_id[..12]));

        log::info!("Connecting to {host_id} ({}@{}:{})", host.username, host.host, host.port);

        let mut master = Command::new(&self.ssh_program)
            .args(&args)
            .arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&socket)
            .args(["-o", "ControlPersist=no"])
            .arg(&host.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::transport(host_id, format!("failed to start ssh: {e}")))?;

        // Dropping this future (connect timeout) drops `master`, which kills it.
        loop {
            if let Some(status) = master
                .try_wait()
                .map_err(|e| RemoteError::transport(host_id, e.to_string()))?
            {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(RemoteError::transport(
                    host_id,
                    format!("ssh exited with {status}: {}", stderr.trim()),
                ));
            }
            if control_check(&self.ssh_program, &socket, &host.host).await {
                break;
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        log::info!("Connected to {host_id}");

        Ok(Arc::new(OpenSshSession {
            host_id: host_id.to_string(),
            destination: host.host.clone(),
            ssh_program: self.ssh_program.clone(),
            args,
            socket,
            master: Mutex::new(Some(master)),
            healthy: AtomicBool::new(true),
        }))
    }
}

async fn control_check(ssh_program: &str, socket: &Path, destination: &str) -> bool {
    Command::new(ssh_program)
        .arg("-S")
        .arg(socket)
        .args(["-O", "check"])
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

struct OpenSshSession {
    host_id: String,
    destination: String,
    ssh_program: String,
    args: Vec<String>,
    socket: PathBuf,
    master: Mutex<Option<Child>>,
    healthy: AtomicBool,
}

impl OpenSshSession {
    fn master_alive(&self) -> bool {
        match self.master.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            },
            Err(_) => false,
        }
    }
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn is_ready(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.master_alive()
    }

    async fn exec(&self, command: &str, output: ChunkSender) -> Result<Option<i32>> {
        if !self.is_ready() {
            return Err(RemoteError::stream(&self.host_id, "session is not connected"));
        }

        // The remote login shell may not be POSIX; hand the command to sh.
        let remote_command = format!("sh -c {}", shell::quote(command)?);

        let child = Command::new(&self.ssh_program)
            .args(&self.args)
            .arg("-S")
            .arg(&self.socket)
            .args(["-o", "ControlMaster=no", "-T"])
            .arg(&self.destination)
            .arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::exec_failed(&self.host_id, format!("failed to start ssh: {e}")))?;

        let status = pump_child(&self.host_id, child, &output).await?;
        let code = status.code();

        if code == Some(SSH_FAILURE_STATUS) && !self.master_alive() {
            self.healthy.store(false, Ordering::SeqCst);
            return Err(RemoteError::stream(&self.host_id, "connection lost during command"));
        }

        Ok(code)
    }

    async fn close(&self) {
        self.healthy.store(false, Ordering::SeqCst);

        let _ = Command::new(&self.ssh_program)
            .arg("-S")
            .arg(&self.socket)
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let master = self.master.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut child) = master {
            let _ = child.kill().await;
        }
        let _ = std::fs::remove_file(&self.socket);
        log::info!("Closed session to {}", self.host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn host(identity: Option<&str>) -> HostConfig {
        HostConfig {
            host: "10.0.0.5".to_string(),
            port: 2222,
            username: "deploy".to_string(),
            identity_file: identity.map(str::to_string),
            transport: TransportKind::Ssh,
        }
    }

    #[test]
    fn base_args_include_port_user_and_batch_mode() {
        let args = base_args(&host(None)).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-l deploy"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(!joined.contains("-i "));
    }

    #[test]
    fn base_args_add_identity_file() {
        let args = base_args(&host(Some("/keys/id_ed25519"))).unwrap();
        let idx = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[idx + 1], "/keys/id_ed25519");
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
    }

    #[tokio::test]
    async fn missing_ssh_binary_is_transport_error() {
        let connector = OpenSshConnector::new("/nonexistent/ssh", std::env::temp_dir());
        let err = connector.connect("web1", &host(None)).await.err().unwrap();
        assert!(matches!(err, RemoteError::TransportError { .. }));
    }

    #[tokio::test]
    async fn master_that_exits_is_transport_error() {
        // `false` stands in for an ssh that fails authentication immediately.
        let connector = OpenSshConnector::new("false", std::env::temp_dir());
        let err = connector.connect("web1", &host(None)).await.err().unwrap();
        assert!(matches!(err, RemoteError::TransportError { host, .. } if host == "web1"));
    }
}
