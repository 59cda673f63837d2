use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parley_api::ApiClient;
use parley_session::{Command, SessionEngine, WsTransport, run_session};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::app::{App, Flow};
use crate::error::{ApiSnafu, CliResult, SessionSnafu, TerminalSnafu};
use crate::history::ApiHistory;
use crate::render::Renderer;
use crate::settings::{ClientSettings, SettingsStore};

mod app;
mod error;
mod history;
mod render;
mod repl;
mod settings;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Terminal client for a streaming conversation server.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Args {
    /// Settings file; defaults to the per-user config directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// WebSocket endpoint, overrides the settings file for this run.
    #[arg(long)]
    server_url: Option<String>,
    /// HTTP api base, overrides the settings file for this run.
    #[arg(long)]
    api_url: Option<String>,
    /// Print reasoning deltas as they stream.
    #[arg(long)]
    show_thinking: bool,
}

impl Args {
    fn apply(&self, settings: &ClientSettings) -> ClientSettings {
        let mut settings = settings.clone();
        if let Some(url) = &self.server_url {
            settings.server_url = url.clone();
        }
        if let Some(url) = &self.api_url {
            settings.api_base_url = url.clone();
        }
        settings.normalized()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(Args::parse()).await {
        tracing::error!(error = %error, "parley stopped");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> CliResult<()> {
    let store = match &args.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = args.apply(&store.settings());
    tracing::info!(
        server = %settings.server_url,
        api = %settings.api_base_url,
        config = %store.config_path().display(),
        "starting parley"
    );

    let api = ApiClient::new(settings.api_config()).context(ApiSnafu {
        stage: "build-api-client",
    })?;
    let catalog = api.fetch_models().await;
    if let Some(warning) = &catalog.warning {
        tracing::warn!(warning = %warning, source = ?catalog.source, "model catalog degraded");
    }

    let handle = WsTransport::open(settings.transport_config()).context(SessionSnafu {
        stage: "open-transport",
    })?;
    let worker = tokio::spawn(handle.worker);
    let engine =
        SessionEngine::new(handle.transport).with_model(Some(catalog.default_model.clone()));
    let history = Arc::new(ApiHistory::new(api.clone(), settings.history_limit));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = tokio::spawn(run_session(
        engine,
        handle.events,
        commands_rx,
        history,
        events_tx,
    ));

    let mut app = App::new(
        commands_tx.clone(),
        api,
        store,
        catalog,
        Renderer::new(args.show_thinking),
        std::io::stdout(),
    );
    app.say("type /help for commands")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(TerminalSnafu { stage: "read-line" })? else {
                    break;
                };
                let outcome = match repl::parse(&line) {
                    Ok(Some(command)) => app.on_command(command).await,
                    Ok(None) => Ok(Flow::Continue),
                    Err(error) => Err(error),
                };
                match outcome {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(error) => app.say(&format!("! {error}"))?,
                }
            }
            event = events_rx.recv() => match event {
                Some(event) => app.on_event(event)?,
                None => {
                    tracing::info!("session task ended");
                    break;
                }
            },
        }
    }

    if commands_tx.send(Command::Shutdown).is_err() {
        tracing::debug!("session task already stopped");
    }
    match session.await {
        Ok(engine) => tracing::info!(turns = engine.turns().len(), "session closed"),
        Err(error) => tracing::warn!(error = %error, "session task failed"),
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
        tracing::warn!("transport worker did not stop in time");
    }
    Ok(())
}
