use async_trait::async_trait;
use std::borrow::Cow;
use tracing::{debug, warn};

use super::capture::{Capture, MARKER_ECHO};
use super::transport::{RemoteOutput, Transport};
use super::{Session, SessionKind, SessionState};
use crate::error::{EngineError, EngineResult};

/// Separates pane content from the process check in a probe reply
const PROBE_SEPARATOR: &str = "__TMUX_SSH_PROBE__";

/// Exit status the probe script uses for a missing session
const MISSING_SESSION: i32 = 3;

/// Fresh view of one session: captured output plus process presence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    pub exists: bool,
    pub running: bool,
    pub capture: Capture,
}

impl Probe {
    pub fn state(&self) -> SessionState {
        SessionState::derive(self.running, self.capture.exit_code)
    }
}

/// Queries and mutates the sessions living on the remote host.
///
/// Nothing here is cached: every call re-derives state from the host.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Managed sessions with their derived state, ordered by name
    async fn list(&self) -> EngineResult<Vec<Session>>;

    async fn exists(&self, name: &str) -> EngineResult<bool>;

    /// Capture output and check for a live process in one round trip
    async fn probe(&self, name: &str) -> EngineResult<Probe>;

    async fn is_running(&self, name: &str) -> EngineResult<bool> {
        Ok(self.probe(name).await?.running)
    }

    /// Type `command` into the session, creating it if absent
    async fn dispatch(&self, name: &str, command: &str) -> EngineResult<()>;

    /// Terminate the foreground process, leaving the session shell alive
    async fn terminate(&self, name: &str) -> EngineResult<()>;

    /// Destroy the session entirely
    async fn destroy(&self, name: &str) -> EngineResult<()>;

    /// Drop locally cached identity material
    async fn forget_credentials(&self) -> EngineResult<()>;
}

/// Registry backed by the `tmux` CLI on the remote host
pub struct TmuxRegistry<T> {
    transport: T,
}

impl<T: Transport> TmuxRegistry<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    async fn run_checked(&self, script: &str) -> EngineResult<RemoteOutput> {
        let output = self.transport.run(script).await?;
        if !output.success() {
            return Err(EngineError::Remote(remote_reason(&output)));
        }
        Ok(output)
    }
}

fn quote(value: &str) -> EngineResult<Cow<'_, str>> {
    shlex::try_quote(value).map_err(|_| EngineError::Quote(value.to_string()))
}

/// Exact-match session target
fn session_target(name: &str) -> EngineResult<String> {
    Ok(quote(&format!("={}", name))?.into_owned())
}

/// Active pane of the named session
fn pane_target(name: &str) -> EngineResult<String> {
    Ok(quote(&format!("={}:", name))?.into_owned())
}

fn remote_reason(output: &RemoteOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr.to_string()
    }
}

fn list_script() -> String {
    "tmux list-sessions -F '#{session_name}|#{session_created}|#{session_activity}|#{@tmux_ssh_command}'"
        .to_string()
}

fn probe_script(name: &str) -> EngineResult<String> {
    let pane = pane_target(name)?;
    Ok(format!(
        "pid=$(tmux display-message -p -t {pane} '#{{pane_pid}}' 2>/dev/null) || exit {MISSING_SESSION}\n\
         tmux capture-pane -p -J -S - -t {pane}\n\
         echo {PROBE_SEPARATOR}\n\
         if pgrep -P \"$pid\" >/dev/null 2>&1; then echo running; else echo idle; fi"
    ))
}

/// Line typed into the pane. The command goes through `eval` as one word, so a
/// trailing `;`, `&` or comment cannot break or swallow the marker echo.
fn wrap_command(command: &str) -> EngineResult<String> {
    Ok(format!("clear; eval {}; {}", quote(command)?, MARKER_ECHO))
}

fn dispatch_script(name: &str, command: &str) -> EngineResult<String> {
    let session = session_target(name)?;
    let pane = pane_target(name)?;
    let keys = wrap_command(command)?;
    Ok(format!(
        "set -e\n\
         tmux has-session -t {session} 2>/dev/null || tmux new-session -d -s {bare}\n\
         tmux send-keys -R -t {pane}\n\
         tmux clear-history -t {pane}\n\
         tmux set-option -t {session} @tmux_ssh_command {command}\n\
         tmux send-keys -t {pane} -l {keys}\n\
         tmux send-keys -t {pane} Enter",
        bare = quote(name)?,
        command = quote(command)?,
        keys = quote(&keys)?,
    ))
}

fn terminate_script(name: &str) -> EngineResult<String> {
    let pane = pane_target(name)?;
    Ok(format!(
        "pid=$(tmux display-message -p -t {pane} '#{{pane_pid}}' 2>/dev/null) || exit {MISSING_SESSION}\n\
         tmux send-keys -t {pane} C-c\n\
         pkill -TERM -P \"$pid\" 2>/dev/null || true"
    ))
}

/// Parse one `list-sessions` line; unmanaged names yield `None`
fn parse_session_line(line: &str) -> Option<(String, SessionKind, u64, u64, Option<String>)> {
    let parts: Vec<&str> = line.splitn(4, '|').collect();
    if parts.len() < 3 {
        return None;
    }

    let name = parts[0].to_string();
    let kind = SessionKind::of(&name)?;
    let started_at = parts[1].parse().unwrap_or(0);
    let last_output_at = parts[2].parse().unwrap_or(started_at);
    let command = parts
        .get(3)
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    Some((name, kind, started_at, last_output_at, command))
}

fn parse_probe(stdout: &str) -> Probe {
    let (pane, tail) = match stdout.rfind(PROBE_SEPARATOR) {
        Some(at) => (&stdout[..at], &stdout[at + PROBE_SEPARATOR.len()..]),
        None => (stdout, ""),
    };

    Probe {
        exists: true,
        running: tail.trim() == "running",
        capture: Capture::parse(pane),
    }
}

#[async_trait]
impl<T: Transport> SessionRegistry for TmuxRegistry<T> {
    async fn list(&self) -> EngineResult<Vec<Session>> {
        let output = self.transport.run(&list_script()).await?;

        if !output.success() {
            if output.stderr.contains("no server running") || output.stderr.contains("no sessions")
            {
                return Ok(Vec::new());
            }
            return Err(EngineError::Remote(remote_reason(&output)));
        }

        let mut sessions = Vec::new();
        for line in output.stdout.lines() {
            let Some((name, kind, started_at, last_output_at, command)) = parse_session_line(line)
            else {
                continue;
            };

            let probe = self.probe(&name).await?;
            if !probe.exists {
                // Destroyed between the two round trips
                continue;
            }

            sessions.push(Session {
                state: probe.state(),
                name,
                kind,
                started_at,
                last_output_at,
                command,
            });
        }

        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = sessions.len(), "listed managed sessions");
        Ok(sessions)
    }

    async fn exists(&self, name: &str) -> EngineResult<bool> {
        let script = format!("tmux has-session -t {} 2>/dev/null", session_target(name)?);
        let output = self.transport.run(&script).await?;
        Ok(output.success())
    }

    async fn probe(&self, name: &str) -> EngineResult<Probe> {
        let output = self.transport.run(&probe_script(name)?).await?;

        match output.status {
            0 => Ok(parse_probe(&output.stdout)),
            MISSING_SESSION => Ok(Probe::default()),
            _ => Err(EngineError::Remote(remote_reason(&output))),
        }
    }

    async fn dispatch(&self, name: &str, command: &str) -> EngineResult<()> {
        debug!(session = name, command, "dispatching");
        self.run_checked(&dispatch_script(name, command)?).await?;
        Ok(())
    }

    async fn terminate(&self, name: &str) -> EngineResult<()> {
        let output = self.transport.run(&terminate_script(name)?).await?;

        match output.status {
            0 => Ok(()),
            MISSING_SESSION => Err(EngineError::NotFound(name.to_string())),
            _ => Err(EngineError::Remote(remote_reason(&output))),
        }
    }

    async fn destroy(&self, name: &str) -> EngineResult<()> {
        let script = format!("tmux kill-session -t {}", session_target(name)?);
        self.run_checked(&script).await?;
        Ok(())
    }

    async fn forget_credentials(&self) -> EngineResult<()> {
        if let Err(err) = self.transport.forget_credentials().await {
            warn!(error = %err, "could not close cached ssh connection");
        }
        Ok(())
    }
}
