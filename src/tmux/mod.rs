mod capture;
mod registry;
mod transport;

pub use capture::{common_prefix_len, Capture, EXIT_MARKER};
pub use registry::{Probe, SessionRegistry, TmuxRegistry};
pub use transport::{SshTransport, TransportError};

/// Name of the well-known default session
pub const PRIMARY_SESSION: &str = "remote_task";

/// Prefix shared by every pool session
pub const POOL_PREFIX: &str = "task_";

/// Remote endpoint for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub hostname: String,
    pub username: String,
    pub port: u16,
}

impl Config {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            port,
        }
    }

    /// `user@host` form passed to ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// Naming class of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The single default-named session, never reclaimed by cleanup
    Primary,
    /// A uniquely suffixed session for parallel commands
    Pool,
}

impl SessionKind {
    /// Classify a session name; `None` for sessions this tool does not manage
    pub fn of(name: &str) -> Option<Self> {
        if name == PRIMARY_SESSION {
            Some(Self::Primary)
        } else if name.len() > POOL_PREFIX.len() && name.starts_with(POOL_PREFIX) {
            Some(Self::Pool)
        } else {
            None
        }
    }
}

/// Derived state of a session, recomputed on every query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Shell prompt with nothing dispatched yet
    Idle,
    /// A foreground process is alive in the pane
    Running,
    /// Last command exited with status 0
    Completed,
    /// Last command exited with a non-zero status
    Error,
}

impl SessionState {
    pub fn derive(running: bool, exit_code: Option<i32>) -> Self {
        match (running, exit_code) {
            (true, _) => Self::Running,
            (false, Some(0)) => Self::Completed,
            (false, Some(_)) => Self::Error,
            (false, None) => Self::Idle,
        }
    }

    /// Whether cleanup may reclaim a session in this state
    pub fn is_reclaimable(self) -> bool {
        matches!(self, Self::Idle | Self::Completed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Represents a managed tmux session on the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session name
    pub name: String,
    /// Naming class
    pub kind: SessionKind,
    /// State derived from the latest probe
    pub state: SessionState,
    /// Unix timestamp when the session was created
    pub started_at: u64,
    /// Unix timestamp of the last pane activity
    pub last_output_at: u64,
    /// Command last dispatched into the session
    pub command: Option<String>,
}

/// Allocate a fresh pool session name
pub fn pool_session_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", POOL_PREFIX, &id[..8])
}
