mod controller;
mod lifecycle;
mod outcome;
mod streamer;

#[cfg(test)]
pub(crate) mod fake;

pub use outcome::{ExecuteOptions, ExecutionOutcome, Status, StreamOptions};

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::error::EngineResult;
use crate::tmux::SessionRegistry;
use streamer::{Streamer, POLL_INTERVAL};

/// How long a terminated process may take to go away
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Probe spacing while waiting for a process to stop
const STOP_POLL: Duration = Duration::from_millis(250);

/// Session orchestration over a remote registry.
///
/// Holds no session state of its own; every decision re-queries the host.
pub struct Engine<R> {
    registry: R,
    poll_interval: Duration,
    cancel: watch::Receiver<bool>,
    last_session: Option<String>,
}

impl<R: SessionRegistry> Engine<R> {
    /// `cancel` flips to `true` when the operator interrupts
    pub fn new(registry: R, cancel: watch::Receiver<bool>) -> Self {
        Self {
            registry,
            poll_interval: POLL_INTERVAL,
            cancel,
            last_session: None,
        }
    }

    /// Session saved from a previous run, tried when attach finds nothing running
    pub fn with_last_session(mut self, session: Option<String>) -> Self {
        self.last_session = session;
        self
    }

    #[cfg(test)]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Follow a session's output until it completes or a limit fires
    pub async fn stream(
        &self,
        session: &str,
        options: StreamOptions,
        sink: &mut (dyn FnMut(&str) + Send),
    ) -> ExecutionOutcome {
        Streamer::new(&self.registry, session, options, self.poll_interval)
            .run(sink, self.cancel.clone())
            .await
    }

    /// Wait for the foreground process to disappear; `false` if it outlived the wait
    async fn wait_until_stopped(&self, session: &str) -> EngineResult<bool> {
        let deadline = Instant::now() + STOP_WAIT;
        loop {
            if !self.registry.is_running(session).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(STOP_POLL).await;
        }
    }
}
