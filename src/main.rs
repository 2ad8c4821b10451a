//! # duet
//!
//! Server binary: loads settings, installs logging and metrics, and serves
//! the private room until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duet_server::DuetApp;
use duet_settings::{load_settings_from_path, settings_path, DuetSettings, StoreBackend};

#[derive(Parser, Debug)]
#[command(name = "duet", about = "Two-user chat delivery server", version)]
struct Cli {
    /// Settings file (defaults to `$DUET_CONFIG` or `~/.duet/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/SSE server.
    Serve {
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,

        /// Persist to this `SQLite` file instead of the configured backend.
        #[arg(long)]
        sqlite: Option<PathBuf>,
    },
    /// Print the effective settings as JSON.
    Config,
}

fn load(cli: &Cli) -> Result<DuetSettings> {
    let path = cli.config.clone().unwrap_or_else(settings_path);
    load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(&cli)?;

    match cli.command {
        Command::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&settings).context("failed to encode settings")?
            );
            Ok(())
        }
        Command::Serve { host, port, sqlite } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(path) = sqlite {
                settings.store.backend = StoreBackend::Sqlite;
                settings.store.sqlite_path = path.display().to_string();
            }
            serve(settings).await
        }
    }
}

async fn serve(settings: DuetSettings) -> Result<()> {
    duet_telemetry::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = match duet_telemetry::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let app = DuetApp::from_settings(settings).context("failed to open store")?;
    let handle = duet_server::start(app, metrics)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port(), "duet ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.stop().await;
    Ok(())
}
