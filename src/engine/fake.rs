//! In-memory tmux host driven by tokio's clock, for engine tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::tmux::{
    Capture, Probe, Session, SessionKind, SessionRegistry, TransportError, EXIT_MARKER,
};

/// Exit status a shell reports for a SIGTERM'd child
const TERMINATED: i32 = 143;

/// Scripted behaviour of a command on the fake host
#[derive(Debug, Clone)]
pub struct Program {
    lines: Vec<(Duration, String)>,
    runs_for: Option<Duration>,
    exit_code: i32,
    marker: bool,
    /// Keeps running through SIGTERM
    stubborn: bool,
}

impl Program {
    /// Exits immediately, successfully, without output
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            runs_for: Some(Duration::ZERO),
            exit_code: 0,
            marker: true,
            stubborn: false,
        }
    }

    pub fn line(mut self, at: Duration, text: &str) -> Self {
        self.lines.push((at, text.to_string()));
        self
    }

    pub fn runs_for(mut self, duration: Duration) -> Self {
        self.runs_for = Some(duration);
        self
    }

    pub fn forever(mut self) -> Self {
        self.runs_for = None;
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn without_marker(mut self) -> Self {
        self.marker = false;
        self
    }

    pub fn stubborn(mut self) -> Self {
        self.stubborn = true;
        self
    }
}

#[derive(Debug)]
struct Job {
    program: Program,
    started: Instant,
    killed_at: Option<Instant>,
}

impl Job {
    fn elapsed(&self, now: Instant) -> Duration {
        self.killed_at.unwrap_or(now) - self.started
    }

    fn running(&self, now: Instant) -> bool {
        if self.killed_at.is_some() {
            return false;
        }
        self.program
            .runs_for
            .map_or(true, |limit| self.elapsed(now) < limit)
    }

    fn screen(&self, now: Instant) -> String {
        let elapsed = self.elapsed(now);
        let mut lines: Vec<String> = self
            .program
            .lines
            .iter()
            .filter(|(at, _)| *at <= elapsed)
            .map(|(_, text)| text.clone())
            .collect();

        if !self.running(now) && self.program.marker {
            let code = if self.killed_at.is_some() {
                TERMINATED
            } else {
                self.program.exit_code
            };
            lines.push(format!("{}{}", EXIT_MARKER, code));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Default)]
struct FakeSession {
    job: Option<Job>,
    command: Option<String>,
}

#[derive(Debug, Default)]
struct HostState {
    sessions: BTreeMap<String, FakeSession>,
    programs: HashMap<String, Program>,
    dispatched: Vec<(String, String)>,
    terminated: Vec<String>,
    destroyed: Vec<String>,
    probes: usize,
    fail_after_probes: Option<usize>,
    offline: bool,
    forgot_credentials: bool,
}

/// Fake remote host implementing the session registry
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register how `command` behaves once dispatched
    pub fn program(self, command: &str, program: Program) -> Self {
        self.state
            .lock()
            .unwrap()
            .programs
            .insert(command.to_string(), program);
        self
    }

    /// Fail every round trip after `n` successful probes
    pub fn fail_after_probes(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_after_probes = Some(n);
        self
    }

    pub fn offline(self) -> Self {
        self.state.lock().unwrap().offline = true;
        self
    }

    /// Create a session with a bare shell
    pub fn idle_session(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(name.to_string(), FakeSession::default());
        self
    }

    pub fn dispatched(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().dispatched.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions.keys().cloned().collect()
    }

    pub fn forgot_credentials(&self) -> bool {
        self.state.lock().unwrap().forgot_credentials
    }

    /// Mutations performed so far, ignoring queries
    pub fn mutations(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.dispatched.len() + state.terminated.len() + state.destroyed.len()
    }

    fn check_online(state: &HostState) -> EngineResult<()> {
        let exhausted = state
            .fail_after_probes
            .is_some_and(|limit| state.probes >= limit);
        if state.offline || exhausted {
            return Err(EngineError::Connection(TransportError::Unreachable {
                host: "fake".to_string(),
                reason: "Connection refused".to_string(),
            }));
        }
        Ok(())
    }

    fn probe_locked(state: &HostState, name: &str, now: Instant) -> Probe {
        let Some(session) = state.sessions.get(name) else {
            return Probe::default();
        };
        let (running, screen) = match &session.job {
            Some(job) => (job.running(now), job.screen(now)),
            None => (false, String::new()),
        };
        Probe {
            exists: true,
            running,
            capture: Capture::parse(&screen),
        }
    }
}

#[async_trait]
impl SessionRegistry for FakeHost {
    async fn list(&self) -> EngineResult<Vec<Session>> {
        let state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        let now = Instant::now();

        Ok(state
            .sessions
            .iter()
            .filter_map(|(name, session)| {
                let kind = SessionKind::of(name)?;
                let probe = Self::probe_locked(&state, name, now);
                Some(Session {
                    name: name.clone(),
                    kind,
                    state: probe.state(),
                    started_at: 0,
                    last_output_at: 0,
                    command: session.command.clone(),
                })
            })
            .collect())
    }

    async fn exists(&self, name: &str) -> EngineResult<bool> {
        let state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        Ok(state.sessions.contains_key(name))
    }

    async fn probe(&self, name: &str) -> EngineResult<Probe> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        state.probes += 1;
        Ok(Self::probe_locked(&state, name, Instant::now()))
    }

    async fn dispatch(&self, name: &str, command: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;

        let program = state
            .programs
            .get(command)
            .cloned()
            .unwrap_or_else(Program::new);
        state
            .dispatched
            .push((name.to_string(), command.to_string()));

        let session = state.sessions.entry(name.to_string()).or_default();
        session.command = Some(command.to_string());
        session.job = Some(Job {
            program,
            started: Instant::now(),
            killed_at: None,
        });
        Ok(())
    }

    async fn terminate(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        state.terminated.push(name.to_string());

        let session = state
            .sessions
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        let now = Instant::now();
        if let Some(job) = session.job.as_mut() {
            if job.running(now) && !job.program.stubborn {
                job.killed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn destroy(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        state.destroyed.push(name.to_string());
        state
            .sessions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn forget_credentials(&self) -> EngineResult<()> {
        self.state.lock().unwrap().forgot_credentials = true;
        Ok(())
    }
}
