//! chat-relay: chat bridge for terminal-bound AI CLIs
//!
//! Routes chat messages into tmux sessions running AI coding CLIs, detects
//! when each turn is finished (tool callback or screen polling) and sends
//! the new part of the screen back to the originating channel.
//!
//! Usage:
//!   chat-relay --config /etc/chat-relay.json

mod adapter;
mod config;
mod engine;
mod error;
mod extractor;
mod filter;
mod history;
mod hook_server;
mod protocol;
mod session;
mod socket;
mod terminal;
#[cfg(test)]
mod test_support;
mod watchdog;

use adapter::{CliAdapter, ToolAdapter};
use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use engine::Engine;
use history::InputHistory;
use hook_server::HookServer;
use protocol::ChatMessage;
use socket::SocketConnector;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use terminal::{TerminalBackend, TmuxBackend};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for in-flight watchdogs
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Chat bridge for terminal-bound AI CLIs
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(about = "Chat bridge for terminal-bound AI CLIs")]
#[command(version)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the connector socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Override the hook listener address
    #[arg(long)]
    hook_bind: Option<String>,

    /// tmux binary to drive
    #[arg(long, default_value = "tmux")]
    tmux: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    info!("chat-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&args.config)?;
    if let Some(socket) = args.socket {
        config.socket.path = socket;
    }
    if let Some(bind) = args.hook_bind {
        config.hook = Some(config::HookConfig { bind });
    }
    info!("Config: {}", args.config.display());
    info!("Socket: {}", config.socket.path.display());

    let backend: Arc<dyn TerminalBackend> = Arc::new(TmuxBackend::new(&args.tmux));

    let mut adapters: HashMap<String, Arc<dyn ToolAdapter>> = HashMap::new();
    for (name, profile) in &config.tools {
        let adapter = CliAdapter::new(name, profile.clone(), Arc::clone(&backend))
            .context(format!("Failed to build adapter for {}", name))?;
        adapters.insert(name.clone(), Arc::new(adapter));
    }
    info!("Tools: {:?}", adapters.keys().collect::<Vec<_>>());

    let history = InputHistory::new(config.history.clone());
    info!("History: {}", history.root().display());
    let engine = Engine::new(config.engine_settings(), backend, adapters, history);

    for session in &config.sessions {
        engine
            .add_session(
                &session.name,
                &session.tool,
                session.work_dir.clone(),
                session.auto_start,
            )
            .await
            .context(format!("Failed to register session {}", session.name))?;
    }
    info!("Sessions: {}", config.sessions.len());

    // Create channels
    let (inbound_tx, inbound_rx) = mpsc::channel::<ChatMessage>(config.inbound_queue);
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let stop = CancellationToken::new();
    let hook_stop = CancellationToken::new();

    // Start socket connector
    let connector = SocketConnector::new(
        config.socket.path.clone(),
        &config.socket.platform,
        inbound_tx,
        engine.clone(),
        shutdown_tx,
        stop.clone(),
    );
    let socket_handle = tokio::spawn(async move {
        if let Err(e) = connector.run().await {
            error!("Socket connector error: {:#}", e);
        }
    });

    // Start hook endpoint
    let hook_handle = match &config.hook {
        Some(hook) => {
            let server = HookServer::bind(&hook.bind, engine.clone()).await?;
            let token = hook_stop.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(token).await {
                    error!("Hook endpoint error: {:#}", e);
                }
            }))
        }
        None => {
            info!("Hook endpoint disabled, hook tools fall back to their timeout");
            None
        }
    };

    // Start engine
    let engine_runner = engine.clone();
    let engine_handle = tokio::spawn(async move { engine_runner.run(inbound_rx).await });

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    select! {
        _ = shutdown_rx.recv() => info!("Shutdown requested"),
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    // Stop intake first, then the watchdogs, then the callback endpoint
    stop.cancel();
    engine.shutdown(SHUTDOWN_GRACE).await;
    if let Err(e) = engine_handle.await {
        warn!("Engine task ended abnormally: {}", e);
    }
    hook_stop.cancel();

    if let Some(handle) = hook_handle {
        let _ = handle.await;
    }
    let _ = socket_handle.await;

    info!("chat-relay exiting");
    Ok(())
}
