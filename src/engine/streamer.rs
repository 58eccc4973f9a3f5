use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::outcome::{ExecutionOutcome, Status, StreamOptions};
use crate::tmux::{common_prefix_len, Capture, SessionRegistry};

/// Delay between two probes of a running session
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Probes without a live process before a marker-less exit is believed
const EXIT_GRACE_POLLS: u32 = 2;

/// Which limit made the streamer detach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    IdleTimeout,
    Timeout,
}

/// States of the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Polling,
    Completed,
    StillRunning(Detach),
    Error,
    Interrupted,
}

/// Observations checked after every probe
#[derive(Debug, Clone, Copy)]
pub struct Guards {
    pub exited: bool,
    /// Time since output last grew
    pub idle: Duration,
    /// Time since the stream started
    pub elapsed: Duration,
}

/// Transition out of `Polling`: process exit, then idle timeout, then absolute timeout
pub fn next_state(guards: Guards, options: &StreamOptions) -> StreamState {
    if guards.exited {
        StreamState::Completed
    } else if guards.idle >= options.idle_timeout {
        StreamState::StillRunning(Detach::IdleTimeout)
    } else if options.timeout.is_some_and(|limit| guards.elapsed >= limit) {
        StreamState::StillRunning(Detach::Timeout)
    } else {
        StreamState::Polling
    }
}

/// Resolves once the interrupt flag is raised; never if the sender is gone
pub(crate) async fn interrupted(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Length of the longest tail of `old`, starting on a line boundary, that
/// `new` begins with. Lines dropped from the top of a bounded history leave
/// such a tail behind.
fn scrolled_overlap(old: &str, new: &str) -> Option<usize> {
    old.match_indices('\n')
        .map(|(i, _)| &old[i + 1..])
        .find(|tail| !tail.is_empty() && new.starts_with(tail))
        .map(str::len)
}

/// Follows one session's pane until it completes, times out or fails
pub struct Streamer<'a, R: ?Sized> {
    registry: &'a R,
    session: String,
    options: StreamOptions,
    poll_interval: Duration,
    started: Instant,
    last_output: Instant,
    /// Last normalized pane content
    screen: String,
    /// Everything handed to the sink so far
    output: String,
    absent_polls: u32,
    exit_code: Option<i32>,
    failure: Option<String>,
}

impl<'a, R: SessionRegistry + ?Sized> Streamer<'a, R> {
    pub fn new(
        registry: &'a R,
        session: impl Into<String>,
        options: StreamOptions,
        poll_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            registry,
            session: session.into(),
            options,
            poll_interval,
            started: now,
            last_output: now,
            screen: String::new(),
            output: String::new(),
            absent_polls: 0,
            exit_code: None,
            failure: None,
        }
    }

    pub async fn run(
        mut self,
        sink: &mut (dyn FnMut(&str) + Send),
        mut cancel: watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        debug!(session = %self.session, options = ?self.options, "streaming");
        loop {
            let state = tokio::select! {
                biased;
                _ = interrupted(&mut cancel) => StreamState::Interrupted,
                state = self.step(&mut *sink) => state,
            };

            if state != StreamState::Polling {
                return self.finish(state);
            }

            let pause = self.pause();
            tokio::select! {
                biased;
                _ = interrupted(&mut cancel) => return self.finish(StreamState::Interrupted),
                _ = sleep(pause) => {}
            }
        }
    }

    /// One probe plus the guard evaluation
    async fn step(&mut self, sink: &mut (dyn FnMut(&str) + Send)) -> StreamState {
        let probe = match self.registry.probe(&self.session).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(session = %self.session, error = %err, "probe failed");
                self.failure = Some(err.to_string());
                return StreamState::Error;
            }
        };

        if !probe.exists {
            self.failure = Some(format!("session '{}' disappeared", self.session));
            return StreamState::Error;
        }

        let now = Instant::now();
        if self.observe(&probe.capture, sink) {
            self.last_output = now;
        }

        self.absent_polls = if probe.running { 0 } else { self.absent_polls + 1 };
        self.exit_code = probe.capture.exit_code;

        let exited = !probe.running
            && (probe.capture.exit_code.is_some() || self.absent_polls >= EXIT_GRACE_POLLS);

        next_state(
            Guards {
                exited,
                idle: now - self.last_output,
                elapsed: now - self.started,
            },
            &self.options,
        )
    }

    /// Emit whatever the pane gained since the last probe
    fn observe(&mut self, capture: &Capture, sink: &mut (dyn FnMut(&str) + Send)) -> bool {
        let text = capture.text.as_str();
        let prefix = common_prefix_len(&self.screen, text);

        let chunk = if prefix == self.screen.len() {
            text[prefix..].to_string()
        } else if let Some(kept) = scrolled_overlap(&self.screen, text) {
            // Oldest lines fell out of the history; only the tail is new
            text[kept..].to_string()
        } else {
            // Screen was redrawn; restart from the changed line
            let start = text[..prefix].rfind('\n').map_or(0, |i| i + 1);
            let fresh = &text[start..];
            if fresh.is_empty() || self.output.is_empty() || self.output.ends_with('\n') {
                fresh.to_string()
            } else {
                format!("\n{}", fresh)
            }
        };

        self.screen = capture.text.clone();
        if chunk.is_empty() {
            return false;
        }

        sink(&chunk);
        self.output.push_str(&chunk);
        true
    }

    /// Sleep until the next poll, waking early for a deadline
    fn pause(&self) -> Duration {
        let now = Instant::now();
        let mut pause = self.poll_interval;

        let idle_deadline = self.last_output + self.options.idle_timeout;
        pause = pause.min(idle_deadline.saturating_duration_since(now));

        if let Some(limit) = self.options.timeout {
            pause = pause.min((self.started + limit).saturating_duration_since(now));
        }
        pause
    }

    fn finish(self, state: StreamState) -> ExecutionOutcome {
        let session = self.session.clone();
        let base = ExecutionOutcome::new(Status::Completed)
            .in_session(&session)
            .with_output(self.output);

        let outcome = match state {
            StreamState::Completed => ExecutionOutcome {
                exit_code: self.exit_code,
                ..base
            },
            StreamState::StillRunning(Detach::IdleTimeout) => ExecutionOutcome {
                status: Status::StillRunning,
                ..base
            }
            .with_message(format!(
                "no output for {}s; command still running in '{}'",
                self.options.idle_timeout.as_secs(),
                session
            )),
            StreamState::StillRunning(Detach::Timeout) => ExecutionOutcome {
                status: Status::StillRunning,
                ..base
            }
            .with_message(format!(
                "timeout reached; command still running in '{}'",
                session
            )),
            StreamState::Interrupted => ExecutionOutcome {
                status: Status::Interrupted,
                ..base
            }
            .with_message(format!("interrupted; '{}' left untouched", session)),
            StreamState::Error | StreamState::Polling => ExecutionOutcome {
                status: Status::Error,
                ..base
            }
            .with_message(
                self.failure
                    .unwrap_or_else(|| "stream stopped unexpectedly".to_string()),
            ),
        };

        info!(session = %session, status = ?outcome.status, "stream finished");
        outcome
    }
}
