use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::Config;

/// ssh reserves this status for its own failures
const SSH_FAILURE: i32 = 255;

/// Captured result of one remote round trip
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach {host}: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("authentication to {host} failed: {reason}")]
    AuthFailed { host: String, reason: String },
    #[error("failed to launch ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Executes a shell script on the remote host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run `script` remotely and capture its output
    async fn run(&self, script: &str) -> Result<RemoteOutput, TransportError>;

    /// Drop any locally cached authenticated connection
    async fn forget_credentials(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Transport backed by the system `ssh` client with a shared control master
pub struct SshTransport {
    config: Config,
    ssh_path: String,
    control_path: PathBuf,
}

impl SshTransport {
    pub fn new(config: Config) -> Self {
        let control_dir = dirs::cache_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_default()
            .join("tmux-ssh");

        Self {
            config,
            ssh_path: "ssh".to_string(),
            control_path: control_dir.join("%r@%h:%p"),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            "ControlPersist=10m".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-p".to_string(),
            self.config.port.to_string(),
        ]
    }

    fn classify(&self, stderr: &str) -> TransportError {
        let host = self.config.hostname.clone();
        let reason = stderr.trim().to_string();
        if stderr.contains("Permission denied") || stderr.contains("Host key verification failed")
        {
            TransportError::AuthFailed { host, reason }
        } else {
            TransportError::Unreachable { host, reason }
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(&self, script: &str) -> Result<RemoteOutput, TransportError> {
        if let Some(dir) = self.control_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        debug!(host = %self.config.hostname, script, "ssh round trip");
        let output = Command::new(&self.ssh_path)
            .args(self.base_args())
            .arg(self.config.destination())
            .arg("--")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await?;

        let status = output.status.code().unwrap_or(SSH_FAILURE);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if status == SSH_FAILURE {
            return Err(self.classify(&stderr));
        }

        Ok(RemoteOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    async fn forget_credentials(&self) -> Result<(), TransportError> {
        // Talks to the local control socket only
        let status = Command::new(&self.ssh_path)
            .args(self.base_args())
            .args(["-O", "exit"])
            .arg(self.config.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        debug!(closed = status.success(), "ssh control master exit");
        Ok(())
    }
}
