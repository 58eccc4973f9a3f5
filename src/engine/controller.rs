use tracing::{debug, info, warn};

use super::outcome::{ExecuteOptions, ExecutionOutcome, Status};
use super::streamer::interrupted;
use super::Engine;
use crate::error::{EngineError, EngineResult};
use crate::tmux::{pool_session_name, SessionRegistry, PRIMARY_SESSION};

/// Reaction to a target session that is already running something
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
    /// Terminate the running process and dispatch in its place
    Takeover,
    /// Dispatch into a fresh pool session instead
    Divert,
    /// Report and change nothing
    Block,
}

type ConflictPolicy = fn(&ExecuteOptions) -> Option<Conflict>;

fn force_policy(options: &ExecuteOptions) -> Option<Conflict> {
    options.force.then_some(Conflict::Takeover)
}

fn auto_policy(options: &ExecuteOptions) -> Option<Conflict> {
    options.auto.then_some(Conflict::Divert)
}

/// Consulted in order; the first policy with an answer decides
const CONFLICT_POLICIES: &[ConflictPolicy] = &[force_policy, auto_policy];

fn resolve_conflict(options: &ExecuteOptions) -> Conflict {
    CONFLICT_POLICIES
        .iter()
        .find_map(|policy| policy(options))
        .unwrap_or(Conflict::Block)
}

/// Where a command ended up
#[derive(Debug, Clone, PartialEq, Eq)]
enum Start {
    Dispatched(String),
    Blocked(String),
}

impl<R: SessionRegistry> Engine<R> {
    /// Run `command` remotely and stream its output
    pub async fn execute(
        &self,
        command: &str,
        options: &ExecuteOptions,
        sink: &mut (dyn FnMut(&str) + Send),
    ) -> ExecutionOutcome {
        let mut cancel = self.cancel.clone();
        let started = tokio::select! {
            biased;
            _ = interrupted(&mut cancel) => {
                info!("interrupted before dispatch");
                return ExecutionOutcome::new(Status::Interrupted)
                    .with_message("interrupted; nothing was dispatched");
            }
            started = self.start(command, options) => started,
        };

        match started {
            Ok(Start::Dispatched(session)) => self.stream(&session, options.stream, sink).await,
            Ok(Start::Blocked(session)) => {
                info!(session = %session, "target busy, blocked");
                ExecutionOutcome::blocked(&session)
            }
            Err(err) => {
                warn!(error = %err, "execute failed");
                ExecutionOutcome::failed(&err)
            }
        }
    }

    fn resolve_target(options: &ExecuteOptions) -> String {
        if options.new_session {
            return pool_session_name();
        }
        options
            .session
            .clone()
            .unwrap_or_else(|| PRIMARY_SESSION.to_string())
    }

    async fn start(&self, command: &str, options: &ExecuteOptions) -> EngineResult<Start> {
        if command.trim().is_empty() {
            return Err(EngineError::EmptyCommand);
        }

        let target = Self::resolve_target(options);
        if !self.registry.is_running(&target).await? {
            self.registry.dispatch(&target, command).await?;
            return Ok(Start::Dispatched(target));
        }

        let conflict = resolve_conflict(options);
        debug!(session = %target, ?conflict, "target busy");
        match conflict {
            Conflict::Takeover => {
                info!(session = %target, "terminating running command");
                self.registry.terminate(&target).await?;
                if !self.wait_until_stopped(&target).await? {
                    return Err(EngineError::Unstoppable(target));
                }
                self.registry.dispatch(&target, command).await?;
                Ok(Start::Dispatched(target))
            }
            Conflict::Divert => {
                let pool = pool_session_name();
                info!(busy = %target, session = %pool, "diverting to new session");
                self.registry.dispatch(&pool, command).await?;
                Ok(Start::Dispatched(pool))
            }
            Conflict::Block => Ok(Start::Blocked(target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeHost, Program};
    use crate::engine::StreamOptions;
    use crate::tmux::{SessionKind, SessionState};
    use std::time::Duration;
    use tokio::sync::watch;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn engine(host: FakeHost) -> Engine<FakeHost> {
        Engine::new(host, watch::channel(false).1)
    }

    fn options(idle: u64) -> ExecuteOptions {
        ExecuteOptions {
            stream: StreamOptions::new(None, secs(idle)),
            ..Default::default()
        }
    }

    fn busy_host() -> FakeHost {
        FakeHost::new()
            .program(
                "sleep 100",
                Program::new().line(secs(0), "old line").runs_for(secs(100)),
            )
            .program("echo new", Program::new().line(secs(0), "new line"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_start_dispatches_nothing() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = Engine::new(busy_host(), cancel_rx);
        cancel_tx.send(true).unwrap();

        let outcome = engine
            .execute("echo new", &options(10), &mut |_: &str| {})
            .await;

        assert_eq!(outcome.status, Status::Interrupted);
        assert!(engine.registry().dispatched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_force_wait_dispatches_nothing() {
        let host = FakeHost::new()
            .program("sleep 100", Program::new().runs_for(secs(100)).stubborn())
            .program("echo new", Program::new().line(secs(0), "new line"));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let engine = Engine::new(host, cancel_rx);
        engine
            .execute("sleep 100", &options(1), &mut |_: &str| {})
            .await;

        let force = ExecuteOptions {
            force: true,
            ..options(10)
        };
        let interrupt = async {
            tokio::time::sleep(secs(1)).await;
            cancel_tx.send(true).unwrap();
        };
        let mut sink = |_: &str| {};
        let (outcome, _) = tokio::join!(
            engine.execute("echo new", &force, &mut sink),
            interrupt
        );

        assert_eq!(outcome.status, Status::Interrupted);
        assert_eq!(engine.registry().dispatched().len(), 1);
    }

    #[test]
    fn test_policy_priority() {
        let both = ExecuteOptions {
            force: true,
            auto: true,
            ..Default::default()
        };
        assert_eq!(resolve_conflict(&both), Conflict::Takeover);

        let auto = ExecuteOptions {
            auto: true,
            ..Default::default()
        };
        assert_eq!(resolve_conflict(&auto), Conflict::Divert);
        assert_eq!(resolve_conflict(&ExecuteOptions::default()), Conflict::Block);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_then_echo_completes() {
        let host = FakeHost::new().program(
            "sleep 2 && echo done",
            Program::new().line(secs(2), "done").runs_for(secs(2)),
        );
        let engine = engine(host);

        let outcome = engine
            .execute("sleep 2 && echo done", &options(10), &mut |_: &str| {})
            .await;

        assert_eq!(outcome.status, Status::Completed);
        assert!(outcome.output.contains("done"));
        assert_eq!(outcome.session.as_deref(), Some(PRIMARY_SESSION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_before_first_poll_then_completed() {
        let host = FakeHost::new().program("make", Program::new().runs_for(secs(3)));
        let engine = engine(host);

        let start = engine.start("make", &options(10)).await.unwrap();
        assert_eq!(start, Start::Dispatched(PRIMARY_SESSION.to_string()));
        assert!(engine.registry().is_running(PRIMARY_SESSION).await.unwrap());

        let outcome = engine
            .stream(PRIMARY_SESSION, StreamOptions::new(None, secs(10)), &mut |_: &str| {})
            .await;
        assert_eq!(outcome.status, Status::Completed);

        tokio::time::advance(secs(30)).await;
        let sessions = engine.registry().list().await.unwrap();
        assert_eq!(sessions[0].state, SessionState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_sleep_detaches_and_keeps_running() {
        let host = FakeHost::new().program("sleep 100", Program::new().runs_for(secs(100)));
        let engine = engine(host);

        let started = tokio::time::Instant::now();
        let outcome = engine.execute("sleep 100", &options(1), &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::StillRunning);
        assert!(started.elapsed() <= secs(2));
        assert!(engine.registry().is_running(PRIMARY_SESSION).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_session_blocks_without_mutation() {
        let host = busy_host();
        host.dispatch(PRIMARY_SESSION, "sleep 100").await.unwrap();
        let engine = engine(host);
        let before = engine.registry().mutations();

        let outcome = engine.execute("echo new", &options(10), &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::Blocked);
        assert_eq!(outcome.session.as_deref(), Some(PRIMARY_SESSION));
        assert_eq!(engine.registry().mutations(), before);
        assert!(engine.registry().is_running(PRIMARY_SESSION).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_diverts_to_pool_session() {
        let host = busy_host();
        host.dispatch(PRIMARY_SESSION, "sleep 100").await.unwrap();
        let engine = engine(host);

        let opts = ExecuteOptions {
            auto: true,
            ..options(10)
        };
        let outcome = engine.execute("echo new", &opts, &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::Completed);
        let used = outcome.session.unwrap();
        assert_ne!(used, PRIMARY_SESSION);
        assert_eq!(SessionKind::of(&used), Some(SessionKind::Pool));
        assert!(outcome.output.contains("new line"));
        assert!(engine.registry().is_running(PRIMARY_SESSION).await.unwrap());
        assert!(engine.registry().terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_replaces_running_command() {
        let host = busy_host();
        host.dispatch(PRIMARY_SESSION, "sleep 100").await.unwrap();
        let engine = engine(host);

        let opts = ExecuteOptions {
            force: true,
            auto: true,
            ..options(10)
        };
        let outcome = engine.execute("echo new", &opts, &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::Completed);
        assert_eq!(outcome.session.as_deref(), Some(PRIMARY_SESSION));
        assert!(outcome.output.contains("new line"));
        assert!(!outcome.output.contains("old line"));
        assert_eq!(engine.registry().terminated(), vec![PRIMARY_SESSION.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_fails_when_process_survives() {
        let host = FakeHost::new().program("daemon", Program::new().forever().stubborn());
        host.dispatch(PRIMARY_SESSION, "daemon").await.unwrap();
        let engine = engine(host);

        let opts = ExecuteOptions {
            force: true,
            ..options(10)
        };
        let outcome = engine.execute("echo new", &opts, &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::Error);
        assert_eq!(engine.registry().dispatched().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_always_uses_pool() {
        let engine = engine(FakeHost::new());
        let opts = ExecuteOptions {
            new_session: true,
            session: Some("remote_task".to_string()),
            ..options(10)
        };

        let outcome = engine.execute("true", &opts, &mut |_: &str| {}).await;

        let used = outcome.session.unwrap();
        assert_eq!(SessionKind::of(&used), Some(SessionKind::Pool));
        assert_eq!(engine.registry().dispatched()[0].0, used);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_session_name() {
        let engine = engine(FakeHost::new());
        let opts = ExecuteOptions {
            session: Some("task_build01".to_string()),
            ..options(10)
        };

        let outcome = engine.execute("true", &opts, &mut |_: &str| {}).await;
        assert_eq!(outcome.session.as_deref(), Some("task_build01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_is_error() {
        let engine = engine(FakeHost::new().offline());
        let outcome = engine.execute("true", &options(10), &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::Error);
        assert!(outcome.message.unwrap().contains("cannot reach"));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let engine = engine(FakeHost::new());
        let outcome = engine.execute("   ", &options(10), &mut |_: &str| {}).await;

        assert_eq!(outcome.status, Status::Error);
        assert!(engine.registry().dispatched().is_empty());
    }
}
