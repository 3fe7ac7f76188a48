//! Outpost configuration.
//!
//! # File Format
//!
//! Stored as `config.json` in the Outpost config directory:
//!
//! ```json
//! {
//!   "hosts": {
//!     "web1": { "host": "10.0.0.5", "username": "deploy", "identityFile": "~/.ssh/id_ed25519" },
//!     "local": { "host": "localhost", "username": "me", "transport": "local" }
//!   },
//!   "idleTimeoutSecs": 300,
//!   "hangTimeoutSecs": 30,
//!   "snapshots": { "retention": { "maxAgeDays": 7, "keepMinCount": 5 } }
//! }
//! ```
//!
//! Everything except `hosts` falls back to defaults when omitted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RemoteError, Result};
use crate::paths;

/// How commands reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// OpenSSH client with a ControlMaster socket per host.
    #[default]
    Ssh,
    /// Local `/bin/sh`, no network involved.
    Local,
}

/// Connection details for a single host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Host name or address.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    /// Private key used for authentication. When absent, ssh falls back to
    /// the agent and its own configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,

    #[serde(default)]
    pub transport: TransportKind,
}

fn default_port() -> u16 {
    22
}

/// Age and count rules applied by snapshot cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,

    /// Declared for configuration compatibility. Cleanup does not enforce it.
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_keep_min_count")]
    pub keep_min_count: usize,
}

fn default_max_age_days() -> u32 {
    7
}

fn default_max_size_mb() -> u64 {
    500
}

fn default_keep_min_count() -> usize {
    5
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_size_mb: default_max_size_mb(),
            keep_min_count: default_keep_min_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSettings {
    /// Local append-only metadata log.
    #[serde(default = "default_snapshot_log")]
    pub log_path: String,

    /// Directory on the remote host receiving archives and file backups.
    #[serde(default = "default_remote_snapshot_dir")]
    pub remote_dir: String,

    #[serde(default = "default_true")]
    pub auto_snapshot_on_upload: bool,

    #[serde(default)]
    pub retention: RetentionPolicy,
}

fn default_snapshot_log() -> String {
    "~/.config/outpost/snapshots.jsonl".to_string()
}

fn default_remote_snapshot_dir() -> String {
    "~/.outpost/snapshots".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            log_path: default_snapshot_log(),
            remote_dir: default_remote_snapshot_dir(),
            auto_snapshot_on_upload: true,
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSettings {
    #[serde(default = "default_audit_dir")]
    pub dir: String,
}

fn default_audit_dir() -> String {
    "~/.config/outpost/audit".to_string()
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutpostConfig {
    #[serde(default)]
    pub hosts: HashMap<String, HostConfig>,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_hang_timeout_secs")]
    pub hang_timeout_secs: u64,

    /// Remote directory for detached job output, pid and exit files.
    #[serde(default = "default_job_dir")]
    pub job_dir: String,

    #[serde(default)]
    pub snapshots: SnapshotSettings,

    #[serde(default)]
    pub audit: AuditSettings,
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_hang_timeout_secs() -> u64 {
    30
}

fn default_job_dir() -> String {
    "/tmp/outpost-jobs".to_string()
}

impl Default for OutpostConfig {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
            idle_timeout_secs: default_idle_timeout_secs(),
            hang_timeout_secs: default_hang_timeout_secs(),
            job_dir: default_job_dir(),
            snapshots: SnapshotSettings::default(),
            audit: AuditSettings::default(),
        }
    }
}

impl OutpostConfig {
    /// Default location: `~/.config/outpost/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join("config.json"))
    }

    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RemoteError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: OutpostConfig = serde_json::from_str(contents)
            .map_err(|e| RemoteError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (id, host) in &self.hosts {
            if id.is_empty() {
                return Err(RemoteError::Config("host id cannot be empty".to_string()));
            }
            if host.transport == TransportKind::Ssh && host.host.is_empty() {
                return Err(RemoteError::Config(format!("host {id} has no address")));
            }
        }
        if self.hang_timeout_secs == 0 {
            return Err(RemoteError::Config(
                "hangTimeoutSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn hang_timeout(&self) -> Duration {
        Duration::from_secs(self.hang_timeout_secs)
    }
}
