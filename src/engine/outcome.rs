use std::time::Duration;

use crate::error::EngineError;

/// Floor applied to the idle timeout so a stream always waits a little
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default idle timeout when the caller gives none
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Terminal status of an engine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Remote command finished
    Completed,
    /// Transport failure or remote execution error
    Error,
    /// Target session busy and no auto/force given
    Blocked,
    /// A timeout fired while the remote command keeps running
    StillRunning,
    /// Local interrupt; the remote session was left alone
    Interrupted,
}

impl Status {
    /// Stable process exit status
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Error => 1,
            Self::Blocked => 2,
            Self::StillRunning => 3,
            Self::Interrupted => 130,
        }
    }

    /// Whether the remote command may still be running after this outcome
    pub fn leaves_job_running(self) -> bool {
        matches!(self, Self::Blocked | Self::StillRunning | Self::Interrupted)
    }
}

/// Result of any operation that waits on or inspects a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: Status,
    /// Everything streamed so far, possibly partial
    pub output: String,
    /// Session actually used, kept by the caller as a reattachment hint
    pub session: Option<String>,
    /// Exit status of the remote command when it reported one
    pub exit_code: Option<i32>,
    /// Human-readable detail for the operator
    pub message: Option<String>,
}

impl ExecutionOutcome {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            output: String::new(),
            session: None,
            exit_code: None,
            message: None,
        }
    }

    pub fn completed() -> Self {
        Self::new(Status::Completed)
    }

    pub fn blocked(session: &str) -> Self {
        Self::new(Status::Blocked)
            .in_session(session)
            .with_message(format!(
                "session '{}' is already running a command; use --force, --new or --auto",
                session
            ))
    }

    pub fn failed(err: &EngineError) -> Self {
        Self::new(Status::Error).with_message(err.to_string())
    }

    pub fn in_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An outcome together with the data the operation produced
#[derive(Debug, Clone)]
pub struct Report<T> {
    pub outcome: ExecutionOutcome,
    pub value: T,
}

/// Streaming limits shared by execute and attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Absolute limit; `None` streams until idle or completion
    pub timeout: Option<Duration>,
    pub idle_timeout: Duration,
}

impl StreamOptions {
    pub fn new(timeout: Option<Duration>, idle_timeout: Duration) -> Self {
        Self {
            timeout,
            idle_timeout: idle_timeout.max(MIN_IDLE_TIMEOUT),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new(None, DEFAULT_IDLE_TIMEOUT)
    }
}

/// Options for dispatching a command
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Explicit target; the primary session when absent
    pub session: Option<String>,
    pub stream: StreamOptions,
    /// Always run in a fresh pool session
    pub new_session: bool,
    /// Terminate whatever runs in the target first
    pub force: bool,
    /// Divert to a fresh pool session when the target is busy
    pub auto: bool,
}
