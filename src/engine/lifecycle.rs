use tracing::{info, warn};

use super::outcome::{ExecutionOutcome, Report, StreamOptions};
use super::Engine;
use crate::error::{EngineError, EngineResult};
use crate::tmux::{Session, SessionKind, SessionRegistry, SessionState};

impl<R: SessionRegistry> Engine<R> {
    /// Managed sessions with their current state
    pub async fn list_running(&self) -> Report<Vec<Session>> {
        match self.registry.list().await {
            Ok(sessions) => Report {
                outcome: ExecutionOutcome::completed(),
                value: sessions,
            },
            Err(err) => Report {
                outcome: ExecutionOutcome::failed(&err),
                value: Vec::new(),
            },
        }
    }

    /// Resume streaming a session, auto-detecting it when `name` is omitted
    pub async fn attach(
        &self,
        name: Option<&str>,
        options: StreamOptions,
        sink: &mut (dyn FnMut(&str) + Send),
    ) -> ExecutionOutcome {
        match self.resolve_session(name, "attach to", true).await {
            Ok(session) => {
                info!(session = %session, "attaching");
                self.stream(&session, options, sink).await
            }
            Err(err) => ExecutionOutcome::failed(&err),
        }
    }

    /// Terminate the process running in a session.
    ///
    /// Unless `force` is set, `confirm` is asked first with the session name.
    pub async fn kill(
        &self,
        name: Option<&str>,
        force: bool,
        confirm: impl FnOnce(&str) -> bool,
    ) -> ExecutionOutcome {
        match self.try_kill(name, force, confirm).await {
            Ok(outcome) => outcome,
            Err(err) => ExecutionOutcome::failed(&err),
        }
    }

    async fn try_kill(
        &self,
        name: Option<&str>,
        force: bool,
        confirm: impl FnOnce(&str) -> bool,
    ) -> EngineResult<ExecutionOutcome> {
        let session = self.resolve_session(name, "kill", false).await?;

        if !self.registry.is_running(&session).await? {
            return Ok(ExecutionOutcome::completed()
                .in_session(&session)
                .with_message(format!("nothing is running in '{}'", session)));
        }

        if !force && !confirm(&session) {
            return Ok(ExecutionOutcome::completed()
                .in_session(&session)
                .with_message("kill cancelled"));
        }

        self.registry.terminate(&session).await?;
        if !self.wait_until_stopped(&session).await? {
            return Err(EngineError::Unstoppable(session));
        }

        info!(session = %session, "killed running command");
        Ok(ExecutionOutcome::completed()
            .in_session(&session)
            .with_message(format!("killed command in '{}'", session)))
    }

    /// Destroy idle pool sessions; the primary session is never touched
    pub async fn cleanup(&self) -> Report<Vec<String>> {
        let sessions = match self.registry.list().await {
            Ok(sessions) => sessions,
            Err(err) => {
                return Report {
                    outcome: ExecutionOutcome::failed(&err),
                    value: Vec::new(),
                }
            }
        };

        let mut removed = Vec::new();
        for session in sessions
            .into_iter()
            .filter(|s| s.kind == SessionKind::Pool && s.state.is_reclaimable())
        {
            if let Err(err) = self.registry.destroy(&session.name).await {
                warn!(session = %session.name, error = %err, "cleanup stopped");
                return Report {
                    outcome: ExecutionOutcome::failed(&err),
                    value: removed,
                };
            }
            removed.push(session.name);
        }

        info!(count = removed.len(), "cleaned up idle sessions");
        Report {
            outcome: ExecutionOutcome::completed()
                .with_message(format!("removed {} idle session(s)", removed.len())),
            value: removed,
        }
    }

    /// Drop cached ssh connection state; no remote round trip
    pub async fn clear_credentials(&self) -> ExecutionOutcome {
        match self.registry.forget_credentials().await {
            Ok(()) => ExecutionOutcome::completed().with_message("cleared stored credentials"),
            Err(err) => ExecutionOutcome::failed(&err),
        }
    }

    /// Pick the session an attach or kill refers to.
    ///
    /// An explicit name must exist. Otherwise exactly one running session must,
    /// falling back to the saved hint when `use_hint` is set and none runs.
    async fn resolve_session(
        &self,
        name: Option<&str>,
        purpose: &'static str,
        use_hint: bool,
    ) -> EngineResult<String> {
        if let Some(name) = name {
            if !self.registry.exists(name).await? {
                return Err(EngineError::NotFound(name.to_string()));
            }
            return Ok(name.to_string());
        }

        let mut running: Vec<String> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|s| s.state == SessionState::Running)
            .map(|s| s.name)
            .collect();

        match running.len() {
            1 => Ok(running.remove(0)),
            0 => {
                if let Some(hint) = self.last_session.as_deref().filter(|_| use_hint) {
                    if self.registry.exists(hint).await? {
                        return Ok(hint.to_string());
                    }
                }
                Err(EngineError::NoTarget(purpose))
            }
            _ => Err(EngineError::AmbiguousTarget(running)),
        }
    }
}
