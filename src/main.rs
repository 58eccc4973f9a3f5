use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

mod cli;
mod engine;
mod error;
mod settings;
mod tmux;
mod ui;

use cli::Cli;
use engine::{Engine, ExecuteOptions, Status, StreamOptions};
use settings::{Settings, SettingsStore};
use tmux::{SshTransport, TmuxRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; stdout is reserved for remote output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(e) => {
            ui::error(&format!("{:#}", e));
            ExitCode::from(Status::Error.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<Status> {
    let store = SettingsStore::default_location()?;
    let saved = store.load();

    let resolved = cli::resolve(&cli, &saved, ui::prompt)?;
    for warning in &resolved.warnings {
        ui::warning(warning);
    }

    let mut settings = Settings {
        host: Some(resolved.config.hostname.clone()),
        user: Some(resolved.config.username.clone()),
        port: Some(resolved.config.port),
        auto_new_session: Some(resolved.auto),
        last_session: saved.last_session.clone(),
    };
    remember(&store, &settings);

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let transport = SshTransport::new(resolved.config.clone());
    let engine = Engine::new(TmuxRegistry::new(transport), cancel_rx)
        .with_last_session(saved.last_session.clone());

    if cli.clear {
        let outcome = engine.clear_credentials().await;
        store.clear()?;
        ui::info(&format!("Removed {}", store.path().display()));
        ui::report(&outcome);
        return Ok(outcome.status);
    }

    let stream = StreamOptions::new(
        cli.timeout.map(Duration::from_secs),
        Duration::from_secs(cli.idle_timeout),
    );
    let mut sink = ui::stream_chunk;

    let outcome = if cli.list {
        let report = engine.list_running().await;
        ui::print_sessions(&report.value);
        report.outcome
    } else if cli.cleanup {
        let report = engine.cleanup().await;
        for name in &report.value {
            ui::info(&format!("Removed {}", name));
        }
        report.outcome
    } else if let Some(target) = cli.attach_target() {
        watch_interrupts(cancel_tx);
        engine.attach(target, stream, &mut sink).await
    } else if let Some(target) = cli.kill_target() {
        engine
            .kill(target, cli.yes, |session| {
                ui::confirm(&format!("Kill the command running in '{}'?", session))
            })
            .await
    } else {
        let command = if resolved.command.is_empty() {
            ui::prompt("Enter the command to run on server")?
        } else {
            resolved.command.clone()
        };
        watch_interrupts(cancel_tx);

        let options = ExecuteOptions {
            session: None,
            stream,
            new_session: cli.new_session,
            force: cli.force,
            auto: resolved.auto,
        };
        ui::info(&format!("Running on {} ...", resolved.config.destination()));
        engine.execute(&command, &options, &mut sink).await
    };

    if let Some(session) = &outcome.session {
        settings.last_session = Some(session.clone());
        remember(&store, &settings);
    }

    debug!(status = ?outcome.status, session = ?outcome.session, "done");
    ui::report(&outcome);
    Ok(outcome.status)
}

/// Route Ctrl-C to the engine instead of killing the process. Installed only
/// once no blocking prompt remains, so a prompt can still be aborted.
fn watch_interrupts(cancel: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel.send(true);
        }
    });
}

/// Saving defaults is best effort
fn remember(store: &SettingsStore, settings: &Settings) {
    if let Err(e) = store.save(settings) {
        debug!(error = %e, "could not save settings");
    }
}
