//! freshd daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use freshd::config::Config;
use freshd::notify::{telegram, Notifier, TelegramClient};
use freshd::orchestrator::Orchestrator;
use freshd::runtime::{ContainerRuntime, DockerRuntime};

#[derive(Debug, Parser)]
#[command(name = "freshd", version, about)]
struct Cli {
    /// TOML configuration file (default: freshd.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Report what would be updated without touching any container
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Load configuration
    let mut cfg = Config::load(cli.config.as_deref())?;
    cfg.dry_run |= cli.dry_run;
    cfg.run_once |= cli.run_once;
    cfg.validate()?;
    info!(
        "Starting freshd on {} for {} (dry run: {}, run once: {})",
        cfg.host_name, cfg.scope, cfg.dry_run, cfg.run_once
    );

    // Container Runtime (Docker)
    let docker = DockerRuntime::connect(cfg.credentials())?;
    docker.ping().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let notifier = Notifier::from_config(&cfg)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // One queued trigger at most; later ones collapse into it.
    let (trigger_tx, trigger_rx) = mpsc::channel(1);

    // Telegram commands
    let listener_handle = if cfg.telegram.commands && !cfg.run_once {
        let client = TelegramClient::from_config(&cfg.telegram)?;
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(telegram::listen_for_commands(
            client, trigger_tx, shutdown,
        )))
    } else {
        drop(trigger_tx);
        None
    };

    // Update loop
    let orchestrator = Orchestrator::from_config(&cfg, runtime, notifier);
    let mut loop_handle = tokio::spawn(orchestrator.run(trigger_rx, shutdown_rx));

    // Graceful Shutdown
    tokio::select! {
        result = &mut loop_handle => {
            if let Err(e) = result {
                error!("Update loop failed: {}", e);
            }
        }
        _ = wait_for_shutdown_signal() => {
            info!("Shutdown requested, letting in-flight updates finish...");
            let _ = shutdown_tx.send(true);
            if let Err(e) = loop_handle.await {
                error!("Update loop failed: {}", e);
            }
        }
    }

    if let Some(handle) = listener_handle {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
            Err(e) => warn!("Unable to listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
}
