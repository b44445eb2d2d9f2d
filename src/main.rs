use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use pipeline_gateway::commands;
use pipeline_gateway::config;
use pipeline_gateway::logging;
use pipeline_gateway::plugin::NativeCatalog;
use pipeline_gateway::state::AppState;
use pipeline_gateway::web;

#[derive(Parser, Debug)]
#[command(name = "pipeline-gateway")]
#[command(about = "Serve dynamically loaded pipelines behind an OpenAI-compatible API", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the gateway (default)
    Run,
    /// Validate configuration and dry-run every plugin file
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file()
            .await
            .context("Failed to load configuration")?,
    };

    let _log_guard = logging::init(&config.logging, args.debug);
    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    if let Command::Check = args.command.unwrap_or(Command::Run) {
        commands::run_config_check(config, NativeCatalog::with_builtins()).await?;
        return Ok(());
    }

    info!("Starting pipeline gateway");
    info!("Plugin directory: {}", config.plugins.dir.display());

    let (state, _shutdown_rx) = AppState::new(config);

    let report = state
        .manager
        .discover_plugins()
        .await
        .context("Failed to scan plugin directory")?;
    info!(
        "Loaded {} plugin(s), quarantined {}",
        report.loaded.len(),
        report.quarantined.len()
    );

    let web_state = state.clone();
    let mut web_handle = tokio::spawn(async move { web::start_server(web_state).await });

    tokio::select! {
        _ = shutdown_signal() => {}
        served = &mut web_handle => {
            // the server only returns early when it could not bind
            match served {
                Ok(Ok(())) => warn!("Server exited unexpectedly"),
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
            }
            state.shutdown().await;
            anyhow::bail!("Server stopped before a shutdown signal");
        }
    }

    info!("Shutting down pipeline gateway");

    let shutdown = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        state.shutdown().await;
        let _ = web_handle.await;
    })
    .await;
    match shutdown {
        Ok(()) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
