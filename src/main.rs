#![forbid(unsafe_code)]

//! `tether-agent`: the remote half of tether.
//!
//! Accepts uploads and updates over HTTP, keeps each workspace's commands
//! running, and streams their output to log subscribers over TCP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tether::agent::{serve_http, AgentState};
use tether::config::{home_dir, AgentConfig};
use tether::process::default_inspector;
use tether::relay::{tcp, Relay};
use tether::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tether-agent", about = "Remote sync agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("tether-agent bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => AgentConfig::load_from_path(path)?,
        None => AgentConfig::default(),
    };
    if let Some(port) = args.port {
        config.http_port = port;
    }
    std::fs::create_dir_all(&config.workspace_dir).map_err(|err| {
        AppError::Config(format!(
            "cannot create workspace dir {}: {err}",
            config.workspace_dir.display()
        ))
    })?;
    let config = Arc::new(config);
    info!(workspace_dir = %config.workspace_dir.display(), "configuration loaded");

    // ── Start relay and listeners ───────────────────────
    let ct = CancellationToken::new();
    let (relay, relay_handle) = Relay::spawn(config.relay_buffer, ct.clone());

    let log_listener = TcpListener::bind((config.bind_address.as_str(), config.log_port)).await?;
    let log_handle = tcp::serve_logs(log_listener, relay.clone(), ct.clone());

    let http_listener =
        TcpListener::bind((config.bind_address.as_str(), config.http_port)).await?;
    let state = Arc::new(AgentState::new(
        Arc::clone(&config),
        relay,
        default_inspector(),
        home_dir(),
    ));

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = serve_http(http_listener, http_state, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!("tether-agent ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    for orchestrator in state.registry.drain().await {
        if let Err(err) = orchestrator.stop().await {
            warn!(workspace_id = orchestrator.workspace_id(), %err, "failed to stop workspace");
        }
    }
    ct.cancel();

    let _ = tokio::join!(http_handle, log_handle, relay_handle);
    info!("tether-agent shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
