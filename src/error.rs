use thiserror::Error;

use crate::tmux::TransportError;

/// Failures surfaced by the session engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Host unreachable or authentication rejected
    #[error(transparent)]
    Connection(#[from] TransportError),
    /// Auto-detection found more than one candidate session
    #[error("more than one running session, pick one of: {}", .0.join(", "))]
    AmbiguousTarget(Vec<String>),
    /// Auto-detection found no candidate session
    #[error("no running session found to {0}")]
    NoTarget(&'static str),
    #[error("command is empty")]
    EmptyCommand,
    /// The foreground process outlived termination
    #[error("process in session '{0}' did not stop")]
    Unstoppable(String),
    #[error("session '{0}' does not exist")]
    NotFound(String),
    /// A tmux invocation on the remote host failed
    #[error("remote tmux command failed: {0}")]
    Remote(String),
    #[error("cannot pass {0:?} to the remote shell")]
    Quote(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
