use anyhow::{bail, Result};
use clap::Parser;

use crate::settings::Settings;
use crate::tmux::Config;

pub const DEFAULT_PORT: u16 = 22;

/// Run remote commands in a tmux session via SSH (batch mode)
#[derive(Debug, Parser)]
#[command(
    name = "tmux-ssh",
    version,
    after_help = "Command quoting: use quotes for commands with shell operators (&&, ||, |, >), \
                  variables ($VAR), wildcards (*) or flags (-la). \
                  Example: tmux-ssh user@host \"cmd1 && cmd2\""
)]
pub struct Cli {
    /// Remote hostname
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Remote username
    #[arg(short = 'U', long)]
    pub user: Option<String>,

    /// SSH port (default: 22)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Clear stored credentials
    #[arg(short = 'C', long)]
    pub clear: bool,

    /// Max seconds to stream output (default: unlimited)
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Exit if no output for N seconds
    #[arg(short, long, value_name = "SECS", default_value_t = 3600)]
    pub idle_timeout: u64,

    /// Create a new unique tmux session (for concurrent commands)
    #[arg(short = 'n', long = "new")]
    pub new_session: bool,

    /// Force execution, kill any running command in the session
    #[arg(short, long)]
    pub force: bool,

    /// Attach to a session and resume streaming (auto-detect if omitted)
    #[arg(short, long, value_name = "SESSION", num_args = 0..=1, default_missing_value = "")]
    pub attach: Option<String>,

    /// List all running commands/sessions
    #[arg(short, long)]
    pub list: bool,

    /// Clean up idle task_* sessions (keeps remote_task)
    #[arg(long)]
    pub cleanup: bool,

    /// Kill the running command in a session (auto-detect if omitted)
    #[arg(short, long, value_name = "SESSION", num_args = 0..=1, default_missing_value = "")]
    pub kill: Option<String>,

    /// Skip the confirmation prompt for --kill
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Auto-create a new session if a command is already running (default)
    #[arg(long, conflicts_with = "no_auto")]
    pub auto: bool,

    /// Block instead if a command is already running
    #[arg(long = "no-auto")]
    pub no_auto: bool,

    /// [user@host[:port]] ["command"]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub positional: Vec<String>,
}

impl Cli {
    /// Explicit `--auto`/`--no-auto`, if any
    pub fn auto_flag(&self) -> Option<bool> {
        match (self.auto, self.no_auto) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    /// `Some(None)` for a bare `--attach`
    pub fn attach_target(&self) -> Option<Option<&str>> {
        self.attach.as_deref().map(non_empty)
    }

    /// `Some(None)` for a bare `--kill`
    pub fn kill_target(&self) -> Option<Option<&str>> {
        self.kill.as_deref().map(non_empty)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|v| !v.is_empty())
}

/// Pieces of an ssh-style `user@host:port` target
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Parse `user@host`, `user@host:port`, `host` or `host:port`
pub fn parse_connection_target(arg: &str) -> Result<Target> {
    let (user, host_part) = match arg.split_once('@') {
        Some((user, rest)) => (Some(user), rest),
        None => (None, arg),
    };

    let (host, port) = match host_part.rsplit_once(':') {
        Some((host, port)) => {
            if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
                bail!("Invalid port: '{}'", port);
            }
            let port = match port.parse::<u16>() {
                Ok(p) if p >= 1 => p,
                _ => bail!("Port out of range: {}", port),
            };
            (host, Some(port))
        }
        None => (host_part, None),
    };

    Ok(Target {
        user: user.filter(|u| !u.is_empty()).map(str::to_string),
        host: Some(host).filter(|h| !h.is_empty()).map(str::to_string),
        port,
    })
}

/// Whether a first positional should be read as a connection target
pub fn looks_like_target(arg: &str) -> bool {
    arg.contains('@')
        || (!arg.starts_with('-') && !arg.contains('/') && !arg.contains(' ') && arg.contains('.'))
}

/// Connection and command after applying flag, positional and saved precedence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub config: Config,
    pub auto: bool,
    pub command: String,
    pub warnings: Vec<String>,
}

/// Resolve host, user and port: positional > flag > saved > prompt (or default port)
pub fn resolve(
    cli: &Cli,
    saved: &Settings,
    mut prompt: impl FnMut(&str) -> Result<String>,
) -> Result<Resolved> {
    let mut target = Target::default();
    let mut command_args: &[String] = &cli.positional;

    if let Some(first) = cli.positional.first() {
        if looks_like_target(first) {
            target = parse_connection_target(first)?;
            command_args = &cli.positional[1..];
        }
    }

    let mut warnings = Vec::new();
    let first = cli.positional.first().map(String::as_str).unwrap_or_default();
    if let (Some(host), Some(flag)) = (&target.host, &cli.host) {
        warnings.push(format!(
            "Both '{}' and -H '{}' provided. Using '{}'.",
            first, flag, host
        ));
    }
    if let (Some(user), Some(flag)) = (&target.user, &cli.user) {
        warnings.push(format!(
            "Both '{}' and -U '{}' provided. Using '{}'.",
            first, flag, user
        ));
    }
    if let (Some(port), Some(flag)) = (target.port, cli.port) {
        warnings.push(format!(
            "Both '{}' and -p '{}' provided. Using port {}.",
            first, flag, port
        ));
    }

    let host = match target.host.or_else(|| cli.host.clone()).or_else(|| saved.host.clone()) {
        Some(host) => host,
        None => prompt("Enter remote hostname")?,
    };
    if host.is_empty() {
        bail!("Hostname is required.");
    }

    let user = match target.user.or_else(|| cli.user.clone()).or_else(|| saved.user.clone()) {
        Some(user) => user,
        None => prompt("Enter remote username")?,
    };
    if user.is_empty() {
        bail!("Username is required.");
    }

    let port = target
        .port
        .or(cli.port)
        .or(saved.port)
        .unwrap_or(DEFAULT_PORT);

    let auto = cli
        .auto_flag()
        .or(saved.auto_new_session)
        .unwrap_or(true);

    Ok(Resolved {
        config: Config::new(host, user, port),
        auto,
        command: command_args.join(" "),
        warnings,
    })
}
