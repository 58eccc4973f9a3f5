use anyhow::{Context, Result};
use crossterm::style::Stylize;
use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::{ExecutionOutcome, Status};
use crate::tmux::{Session, SessionKind, SessionState};

pub fn info(message: &str) {
    eprintln!("{} {}", "[*]".cyan(), message);
}

pub fn success(message: &str) {
    eprintln!("{} {}", "[+]".green(), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", "[!]".yellow(), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", "[x]".red().bold(), message);
}

/// Ask for a line of input
pub fn prompt(question: &str) -> Result<String> {
    eprint!("{} {}: ", "[?]".magenta(), question);
    io::stderr().flush()?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

/// Yes/no question, defaulting to no
pub fn confirm(question: &str) -> bool {
    prompt(&format!("{} [y/N]", question))
        .map(|answer| matches!(answer.to_lowercase().as_str(), "y" | "yes"))
        .unwrap_or(false)
}

/// Print streamed output as it arrives
pub fn stream_chunk(chunk: &str) {
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(chunk.as_bytes());
    let _ = stdout.flush();
}

/// Final status line for an operation
pub fn report(outcome: &ExecutionOutcome) {
    if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
        println!();
    }

    let message = outcome.message.as_deref();
    match outcome.status {
        Status::Completed => {
            let text = match (message, outcome.exit_code) {
                (Some(m), _) => m.to_string(),
                (None, Some(code)) if code != 0 => format!("Command finished with exit code {}", code),
                (None, _) => "Command completed".to_string(),
            };
            success(&text);
        }
        Status::Error => error(message.unwrap_or("Operation failed")),
        Status::Blocked | Status::StillRunning | Status::Interrupted => {
            warning(message.unwrap_or("Command still running"));
        }
    }

    if outcome.status.leaves_job_running() {
        if let Some(session) = &outcome.session {
            info(&format!("Reattach with: tmux-ssh --attach {}", session));
        }
    }
}

fn age(timestamp: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let secs = now.saturating_sub(timestamp);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

pub fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        info("No tmux-ssh sessions on the remote host");
        return;
    }

    println!(
        "{:<16} {:<8} {:<10} {:<10} {:<10} COMMAND",
        "SESSION", "KIND", "STATE", "STARTED", "ACTIVE"
    );
    for session in sessions {
        let kind = match session.kind {
            SessionKind::Primary => "primary",
            SessionKind::Pool => "pool",
        };
        let state = format!("{:<10}", session.state.to_string());
        let state = match session.state {
            SessionState::Running => state.green(),
            SessionState::Error => state.red(),
            SessionState::Idle | SessionState::Completed => state.dark_grey(),
        };
        println!(
            "{:<16} {:<8} {} {:<10} {:<10} {}",
            session.name,
            kind,
            state,
            age(session.started_at),
            age(session.last_output_at),
            session.command.as_deref().unwrap_or("-")
        );
    }
}
